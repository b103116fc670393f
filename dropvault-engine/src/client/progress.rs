use std::time::{Duration, Instant};

use super::ClientEvent;

/// Minimum spacing between two progress events of one transfer.
const EMIT_INTERVAL: Duration = Duration::from_millis(200);

/// Turns byte counts into throttled [`ClientEvent::Progress`] events.
pub(crate) struct ProgressMeter {
    filename: String,
    total: u64,
    /// Bytes already present when this meter started (resume offset).
    base: u64,
    started: Instant,
    last_emit: Option<Instant>,
}

impl ProgressMeter {
    pub(crate) fn new(filename: &str, total: u64) -> Self {
        Self {
            filename: filename.to_owned(),
            total,
            base: 0,
            started: Instant::now(),
            last_emit: None,
        }
    }

    /// Restarts the rate measurement after a resume at `offset`.
    pub(crate) fn rebase(&mut self, offset: u64) {
        self.base = offset;
        self.started = Instant::now();
    }

    /// Returns an event if enough time has passed since the last one, or
    /// if the transfer is complete.
    pub(crate) fn update(&mut self, done: u64) -> Option<ClientEvent> {
        let now = Instant::now();
        let due = self
            .last_emit
            .is_none_or(|last| now.duration_since(last) >= EMIT_INTERVAL);
        if !due && done < self.total {
            return None;
        }
        self.last_emit = Some(now);
        Some(self.event(done))
    }

    #[allow(clippy::cast_precision_loss)]
    fn event(&self, done: u64) -> ClientEvent {
        let secs = self.started.elapsed().as_secs_f64();
        let moved = done.saturating_sub(self.base);
        let bytes_per_sec = if secs > 0.0 { moved as f64 / secs } else { 0.0 };
        ClientEvent::Progress {
            filename: self.filename.clone(),
            bytes_transferred: done,
            total_bytes: self.total,
            bytes_per_sec,
        }
    }
}
