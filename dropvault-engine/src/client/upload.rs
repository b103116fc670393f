use std::path::Path;
use std::time::{Duration, Instant};

use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

use dropvault_core::digest::digest_file;
use dropvault_core::protocol::{
    Command, HandlingMode, MessageType, Response, Status, UploadRequest,
};
use dropvault_core::transport::Connector;
use dropvault_core::{Error, Result};

use super::progress::ProgressMeter;
use super::{Client, ClientEvent};

/// Outcome of a successful upload.
#[derive(Debug, Clone)]
pub struct UploadReport {
    /// Name the file was sent under.
    pub requested: String,
    /// Name the server stored it under.
    pub stored_as: String,
    pub is_duplicate: bool,
    pub handling_mode: HandlingMode,
    pub filesize: u64,
    /// Digest confirmed by the server.
    pub hash: String,
    pub elapsed: Duration,
}

impl<K: Connector> Client<K> {
    /// Uploads the file at `path`, resolving name clashes with `mode`.
    ///
    /// The file is hashed locally first; the server stores it only if the
    /// bytes it receives hash to the same digest.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if `path` is not a readable file,
    /// [`Error::Integrity`] if the server saw different bytes,
    /// [`Error::Rejected`] if the server refused the request, plus
    /// connection errors.
    pub async fn upload(&mut self, path: &Path, mode: HandlingMode) -> Result<UploadReport> {
        let started = Instant::now();
        let requested = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| Error::Protocol(format!("{} has no usable file name", path.display())))?
            .to_owned();

        let meta = match fs::metadata(path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => {
                return Err(Error::NotFound(format!(
                    "{} is not a regular file",
                    path.display()
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let filesize = meta.len();
        let hash = digest_file(path).await?;
        info!(filename = %requested, filesize, hash = %hash, mode = %mode, "Uploading");

        let request = Command::Upload(UploadRequest {
            filename: Some(requested.clone()),
            filesize: Some(filesize),
            hash: Some(hash.clone()),
            handling_mode: Some(mode.as_str().to_owned()),
        });
        let ready = self.exchange(&request).await?.into_result()?;
        if ready.status != Status::Ready {
            self.close().await;
            return Err(Error::Protocol(format!(
                "expected a ready response to UPLOAD, got {:?}",
                ready.status
            )));
        }

        let stored_as = ready.filename.unwrap_or_else(|| requested.clone());
        let is_duplicate = ready.is_duplicate.unwrap_or(false);
        let handling_mode = ready.handling_mode.unwrap_or(mode);
        if is_duplicate {
            self.emit(ClientEvent::DuplicateResolved {
                requested: requested.clone(),
                stored_as: stored_as.clone(),
                mode: handling_mode,
            });
        }

        let done = match self.send_payload(path, &stored_as, filesize).await {
            Ok(done) => done,
            Err(e) => {
                warn!(filename = %requested, error = %e, "Upload failed");
                // Integrity and rejection answers leave the stream in sync.
                if !matches!(e, Error::Integrity { .. } | Error::Rejected { .. }) {
                    self.close().await;
                }
                return Err(e);
            }
        };

        let report = UploadReport {
            requested,
            stored_as,
            is_duplicate,
            handling_mode,
            filesize,
            hash: done.hash.unwrap_or(hash),
            elapsed: started.elapsed(),
        };
        info!(
            filename = %report.stored_as,
            filesize,
            elapsed = ?report.elapsed,
            "Upload complete"
        );
        Ok(report)
    }

    /// Streams `filesize` bytes of `path` and reads the final response.
    async fn send_payload(
        &mut self,
        path: &Path,
        filename: &str,
        filesize: u64,
    ) -> Result<Response> {
        let mut file = fs::File::open(path).await?;
        let mut meter = ProgressMeter::new(filename, filesize);
        let mut buf = vec![0u8; self.config.chunk_size.max(1)];
        let mut sent: u64 = 0;

        while sent < filesize {
            let want = usize::try_from(filesize - sent).map_or(buf.len(), |r| r.min(buf.len()));
            let n = file.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(Error::Transfer(format!(
                    "{} shrank while uploading",
                    path.display()
                )));
            }
            self.framed()?.write_raw(&buf[..n]).await?;
            sent += n as u64;
            if let Some(event) = meter.update(sent) {
                self.emit(event);
            }
        }
        if filesize == 0 {
            if let Some(event) = meter.update(0) {
                self.emit(event);
            }
        }

        self.framed()?
            .read_message::<Response>(MessageType::Response)
            .await?
            .into_result()
    }
}
