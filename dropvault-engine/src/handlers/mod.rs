//! Server-side request handlers.
//!
//! Each handler answers its request on the [`Framed`](crate::framed::Framed)
//! connection. `Ok(())` means the session can read the next request;
//! `Err(..)` means the connection is no longer usable.

pub mod download;
pub mod list;
pub mod upload;

use std::time::{Duration, Instant};

use tracing::info;

/// Minimum spacing between two throughput log lines of one transfer.
const LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Rate-limited throughput logging for one transfer.
pub(crate) struct Throughput<'a> {
    peer: &'a str,
    filename: &'a str,
    total: u64,
    done: u64,
    started: Instant,
    last_log: Instant,
}

impl<'a> Throughput<'a> {
    pub(crate) fn new(peer: &'a str, filename: &'a str, total: u64) -> Self {
        let now = Instant::now();
        Self {
            peer,
            filename,
            total,
            done: 0,
            started: now,
            last_log: now,
        }
    }

    pub(crate) fn record(&mut self, n: usize) {
        self.done += n as u64;
        if self.last_log.elapsed() >= LOG_INTERVAL {
            self.last_log = Instant::now();
            let rate = format!("{:.2}", self.mb_per_sec());
            info!(
                peer = %self.peer,
                filename = %self.filename,
                bytes = self.done,
                total = self.total,
                mb_per_sec = %rate,
                "Transfer progress"
            );
        }
    }

    pub(crate) fn finish(&self) {
        let rate = format!("{:.2}", self.mb_per_sec());
        info!(
            peer = %self.peer,
            filename = %self.filename,
            bytes = self.done,
            elapsed = ?self.started.elapsed(),
            mb_per_sec = %rate,
            "Transfer finished"
        );
    }

    #[allow(clippy::cast_precision_loss)]
    fn mb_per_sec(&self) -> f64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs <= f64::EPSILON {
            return 0.0;
        }
        self.done as f64 / secs / (1024.0 * 1024.0)
    }
}
