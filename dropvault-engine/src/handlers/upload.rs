use tracing::{error, info, warn};

use dropvault_core::digest::DigestAccumulator;
use dropvault_core::protocol::{ErrorCode, HandlingMode, Response, UploadRequest};
use dropvault_core::storage::{StagedFile, Storage, validate_filename};
use dropvault_core::transport::Connection;
use dropvault_core::{Error, Result};

use crate::framed::Framed;
use crate::handlers::Throughput;
use crate::session::SessionConfig;

/// Handles an `UPLOAD` request.
///
/// Flow: validate the request, claim the filename, resolve duplicates
/// (archiving the current file under versioning), answer `ready`, then
/// receive exactly `filesize` raw bytes into a staging file while hashing.
/// The staging file replaces the target only when the digest matches.
///
/// Requests that fail validation are answered and leave no trace on disk.
/// A payload stream that ends early or times out is fatal for the session
/// because the connection no longer sits on a frame boundary.
///
/// # Errors
///
/// Returns an error when the connection must be closed.
pub async fn handle_upload<C: Connection>(
    storage: &Storage,
    config: &SessionConfig,
    framed: &mut Framed<C>,
    request: UploadRequest,
) -> Result<()> {
    let peer = framed.peer().to_owned();

    let (Some(filename), Some(filesize), Some(expected_hash)) =
        (request.filename, request.filesize, request.hash)
    else {
        warn!(peer = %peer, "Upload rejected: missing required fields");
        return framed
            .send_response(&Response::error(
                ErrorCode::Protocol,
                "Missing required fields: filename, filesize and hash",
            ))
            .await;
    };

    let mode = match request
        .handling_mode
        .as_deref()
        .map(str::parse::<HandlingMode>)
        .transpose()
    {
        Ok(mode) => mode.unwrap_or_default(),
        Err(e) => {
            warn!(peer = %peer, filename = %filename, error = %e, "Upload rejected");
            return framed.send_response(&Response::from_error(&e)).await;
        }
    };

    if let Err(e) = validate_filename(&filename) {
        warn!(peer = %peer, error = %e, "Upload rejected");
        return framed.send_response(&Response::from_error(&e)).await;
    }

    // Held until the upload is committed or abandoned.
    let _name_guard = storage.lock(&filename).await;

    let resolution = match storage.resolve(&filename, mode).await {
        Ok(resolution) => resolution,
        Err(e) => {
            warn!(peer = %peer, filename = %filename, error = %e, "Upload rejected");
            return framed.send_response(&Response::from_error(&e)).await;
        }
    };

    if resolution.is_duplicate() && mode == HandlingMode::Versioning {
        if let Err(e) = storage.archive(&filename).await {
            error!(
                peer = %peer,
                filename = %filename,
                error = %e,
                "Failed to archive previous version"
            );
            return framed.send_response(&Response::from_error(&e)).await;
        }
    }

    let target = resolution.filename();
    let mut staged = match storage.stage(target).await {
        Ok(staged) => staged,
        Err(e) => {
            error!(peer = %peer, filename = %target, error = %e, "Failed to create staging file");
            return framed.send_response(&Response::from_error(&e)).await;
        }
    };

    framed
        .send_response(&Response::upload_ready(
            target,
            resolution.is_duplicate(),
            mode,
        ))
        .await?;
    info!(
        peer = %peer,
        filename = %target,
        filesize,
        handling_mode = %mode,
        is_duplicate = resolution.is_duplicate(),
        "Receiving upload"
    );

    let received =
        receive_payload(framed, &mut staged, filesize, config.chunk_size, target).await;
    let received_hash = match received {
        Ok(hash) => hash,
        Err(e) => {
            staged.discard().await;
            warn!(
                peer = %peer,
                filename = %target,
                error = %e,
                "Upload failed, staging file removed"
            );
            if !matches!(e, Error::Timeout) {
                let _ = framed.send_response(&Response::from_error(&e)).await;
            }
            return Err(e);
        }
    };

    if !received_hash.eq_ignore_ascii_case(&expected_hash) {
        staged.discard().await;
        let err = Error::Integrity {
            expected: expected_hash,
            received: received_hash,
        };
        warn!(peer = %peer, filename = %target, error = %err, "Upload rejected");
        return framed.send_response(&Response::from_error(&err)).await;
    }

    if let Err(e) = staged.commit().await {
        let err = Error::Io(e);
        error!(peer = %peer, filename = %target, error = %err, "Failed to move upload into place");
        return framed.send_response(&Response::from_error(&err)).await;
    }

    info!(peer = %peer, filename = %target, hash = %received_hash, "Upload stored");
    framed
        .send_response(&Response::upload_complete(target, &received_hash))
        .await
}

/// Copies exactly `filesize` payload bytes from `framed` into `staged` and
/// returns their digest.
async fn receive_payload<C: Connection>(
    framed: &mut Framed<C>,
    staged: &mut StagedFile,
    filesize: u64,
    chunk_size: usize,
    filename: &str,
) -> Result<String> {
    let peer = framed.peer().to_owned();
    let mut throughput = Throughput::new(&peer, filename, filesize);
    let mut digest = DigestAccumulator::new();
    let mut buf = vec![0u8; chunk_size.max(1)];

    while digest.bytes_hashed() < filesize {
        let remaining = filesize - digest.bytes_hashed();
        let want = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let n = framed.read_raw(&mut buf[..want]).await?;
        if n == 0 {
            return Err(Error::Transfer(format!(
                "connection closed after {} of {filesize} bytes",
                digest.bytes_hashed()
            )));
        }
        staged.write_all(&buf[..n]).await?;
        digest.update(&buf[..n]);
        throughput.record(n);
    }

    throughput.finish();
    Ok(digest.finalize())
}
