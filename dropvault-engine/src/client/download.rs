use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use dropvault_core::digest::DigestAccumulator;
use dropvault_core::protocol::{Command, DownloadRequest, MessageType, ReadyAck, Status};
use dropvault_core::storage::validate_filename;
use dropvault_core::transport::Connector;
use dropvault_core::{Error, Result};

use super::progress::ProgressMeter;
use super::{Client, ClientEvent};

/// Outcome of a successful download.
#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub filename: String,
    /// Where the file was written.
    pub path: PathBuf,
    pub filesize: u64,
    /// Verified digest of the whole file.
    pub hash: String,
    /// Number of times the transfer was resumed.
    pub resumes: u32,
    pub elapsed: Duration,
}

/// What the server promised in its `ready` response.
struct Offer {
    filesize: u64,
    hash: String,
}

impl<K: Connector> Client<K> {
    /// Downloads `filename` into the configured download directory.
    ///
    /// A transfer that breaks off (timeout or dropped connection) is resumed
    /// on a fresh connection from the last byte written, feeding the same
    /// digest. The finished file is kept only if its digest matches the one
    /// the server announced; any failure removes the partial file.
    ///
    /// # Errors
    ///
    /// [`Error::Rejected`] if the server refuses (e.g. unknown file),
    /// [`Error::Integrity`] on digest mismatch, [`Error::Transfer`] when
    /// resuming keeps failing, plus connection errors.
    pub async fn download(&mut self, filename: &str) -> Result<DownloadReport> {
        // The name becomes a local path.
        validate_filename(filename)?;
        fs::create_dir_all(&self.config.download_dir).await?;
        let path = self.config.download_dir.join(filename);

        let result = self.download_into(filename, &path).await;
        if let Err(e) = &result {
            warn!(filename, error = %e, "Download failed");
            match fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "Removed partial download"),
                Err(rm) if rm.kind() == std::io::ErrorKind::NotFound => {}
                Err(rm) => {
                    warn!(path = %path.display(), error = %rm, "Failed to remove partial download");
                }
            }
            if !matches!(e, Error::Rejected { .. } | Error::Integrity { .. }) {
                self.close().await;
            }
        }
        result
    }

    async fn download_into(&mut self, filename: &str, path: &Path) -> Result<DownloadReport> {
        let started = Instant::now();
        let offer = self.request_download(filename, 0).await?;
        self.acknowledge().await?;
        info!(filename, filesize = offer.filesize, hash = %offer.hash, "Downloading");

        let mut file = fs::File::create(path).await?;
        let mut digest = DigestAccumulator::new();
        let mut meter = ProgressMeter::new(filename, offer.filesize);
        let mut buf = vec![0u8; self.config.chunk_size.max(1)];
        let mut received: u64 = 0;
        let mut resumes: u32 = 0;
        let mut stalled: u32 = 0;

        while received < offer.filesize {
            let want =
                usize::try_from(offer.filesize - received).map_or(buf.len(), |r| r.min(buf.len()));
            let read = self.framed()?.read_raw(&mut buf[..want]).await;
            let failure = match read {
                Ok(0) => Error::Connection("connection closed by server".into()),
                Ok(n) => {
                    file.write_all(&buf[..n]).await?;
                    digest.update(&buf[..n]);
                    received += n as u64;
                    stalled = 0;
                    if let Some(event) = meter.update(received) {
                        self.emit(event);
                    }
                    continue;
                }
                Err(e) if e.is_transient() => e,
                Err(e) => return Err(e),
            };

            file.flush().await?;
            loop {
                stalled += 1;
                if stalled > self.config.max_resume_attempts {
                    return Err(Error::Transfer(format!(
                        "download of {filename} stopped at {received} of {} bytes after {} resume attempts: {failure}",
                        offer.filesize, self.config.max_resume_attempts
                    )));
                }
                warn!(
                    filename,
                    offset = received,
                    attempt = stalled,
                    error = %failure,
                    "Download interrupted, resuming"
                );
                self.emit(ClientEvent::Resuming {
                    filename: filename.to_owned(),
                    offset: received,
                    attempt: stalled,
                });
                tokio::time::sleep(self.config.retry_delay).await;

                match self.resume_download(filename, received, &offer).await {
                    Ok(()) => break,
                    Err(e) if is_retryable_on_resume(&e) => {
                        warn!(filename, error = %e, "Resume attempt failed");
                    }
                    Err(e) => return Err(e),
                }
            }
            resumes += 1;
            meter.rebase(received);
        }

        if offer.filesize == 0 {
            if let Some(event) = meter.update(0) {
                self.emit(event);
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        self.emit(ClientEvent::Verifying {
            filename: filename.to_owned(),
        });
        let actual = digest.finalize();
        if !actual.eq_ignore_ascii_case(&offer.hash) {
            return Err(Error::Integrity {
                expected: offer.hash,
                received: actual,
            });
        }

        let report = DownloadReport {
            filename: filename.to_owned(),
            path: path.to_path_buf(),
            filesize: offer.filesize,
            hash: actual,
            resumes,
            elapsed: started.elapsed(),
        };
        info!(
            filename,
            filesize = report.filesize,
            resumes,
            elapsed = ?report.elapsed,
            "Download verified"
        );
        Ok(report)
    }

    /// Sends `DOWNLOAD` and checks the `ready` answer. The server streams
    /// nothing until [`acknowledge`](Self::acknowledge) is called.
    async fn request_download(&mut self, filename: &str, offset: u64) -> Result<Offer> {
        let request = Command::Download(DownloadRequest {
            filename: Some(filename.to_owned()),
            resume_offset: (offset > 0).then_some(offset),
        });
        let response = self.exchange(&request).await?.into_result()?;

        if response.status != Status::Ready {
            return Err(Error::Protocol(format!(
                "expected a ready response to DOWNLOAD, got {:?}",
                response.status
            )));
        }
        let (Some(filesize), Some(hash)) = (response.filesize, response.hash) else {
            return Err(Error::Protocol(
                "ready response is missing filesize or hash".into(),
            ));
        };
        if response.resuming_from.unwrap_or(0) != offset {
            return Err(Error::Protocol(format!(
                "server resumed at {:?}, requested {offset}",
                response.resuming_from
            )));
        }

        Ok(Offer { filesize, hash })
    }

    async fn acknowledge(&mut self) -> Result<()> {
        self.framed()?.send(MessageType::Ack, &ReadyAck::ready()).await
    }

    /// Reconnects and re-requests `filename` from `offset`, acknowledging
    /// only if the server still offers the same content.
    async fn resume_download(&mut self, filename: &str, offset: u64, offer: &Offer) -> Result<()> {
        self.reconnect().await?;
        let resumed = self.request_download(filename, offset).await?;
        if resumed.filesize != offer.filesize || !resumed.hash.eq_ignore_ascii_case(&offer.hash) {
            warn!(
                filename,
                expected = %offer.hash,
                offered = %resumed.hash,
                "File changed on the server"
            );
            // The server is still waiting for an ack on this connection.
            self.close().await;
            return Err(Error::Integrity {
                expected: offer.hash.clone(),
                received: resumed.hash,
            });
        }
        self.acknowledge().await
    }
}

/// Failures worth another resume attempt: the server may simply be
/// restarting.
fn is_retryable_on_resume(err: &Error) -> bool {
    err.is_transient()
        || matches!(
            err,
            Error::ConnectRefused { .. } | Error::ConnectTimeout { .. } | Error::Connect { .. }
        )
}
