use std::io::SeekFrom;

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use dropvault_core::digest::digest_reader;
use dropvault_core::protocol::{
    DownloadRequest, ErrorCode, MessageType, ReadyAck, Response, Status,
};
use dropvault_core::storage::{Storage, validate_filename};
use dropvault_core::transport::Connection;
use dropvault_core::{Error, Result};

use crate::framed::Framed;
use crate::handlers::Throughput;
use crate::session::SessionConfig;

/// Handles a `DOWNLOAD` request.
///
/// Flow: open the file, hash it, answer `ready {filesize, hash,
/// resuming_from}`, wait for the client's ready ack, then stream the bytes
/// from the resume offset to the end. The digest always covers the whole
/// file so a resuming client can verify what it stitched together.
///
/// # Errors
///
/// Returns an error when the connection must be closed.
pub async fn handle_download<C: Connection>(
    storage: &Storage,
    config: &SessionConfig,
    framed: &mut Framed<C>,
    request: DownloadRequest,
) -> Result<()> {
    let peer = framed.peer().to_owned();

    let Some(filename) = request.filename else {
        warn!(peer = %peer, "Download rejected: missing filename");
        return framed
            .send_response(&Response::error(ErrorCode::Protocol, "Missing filename"))
            .await;
    };
    if let Err(e) = validate_filename(&filename) {
        warn!(peer = %peer, error = %e, "Download rejected");
        return framed.send_response(&Response::from_error(&e)).await;
    }
    let offset = request.resume_offset.unwrap_or(0);

    let (mut file, filesize, hash) = match open_verified(storage, &filename, offset).await {
        Ok(opened) => opened,
        Err(e) => {
            warn!(peer = %peer, filename = %filename, offset, error = %e, "Download rejected");
            return framed.send_response(&Response::from_error(&e)).await;
        }
    };

    framed
        .send_response(&Response::download_ready(filesize, &hash, offset))
        .await?;

    match framed.read_message::<ReadyAck>(MessageType::Ack).await {
        Ok(ack) if ack.status == Status::Ready => {}
        Ok(ack) => {
            warn!(
                peer = %peer,
                filename = %filename,
                status = ?ack.status,
                "Download aborted by client"
            );
            return Ok(());
        }
        Err(Error::Protocol(reason)) => {
            warn!(
                peer = %peer,
                filename = %filename,
                error = %reason,
                "Download aborted, no ready ack"
            );
            return Ok(());
        }
        Err(e) => return Err(e),
    }

    file.seek(SeekFrom::Start(offset)).await?;
    let to_send = filesize - offset;
    info!(peer = %peer, filename = %filename, filesize, offset, to_send, "Sending file");

    let mut throughput = Throughput::new(&peer, &filename, to_send);
    let mut buf = vec![0u8; config.chunk_size.max(1)];
    let mut remaining = to_send;
    while remaining > 0 {
        let want = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(Error::Transfer(format!(
                "{filename} shrank while sending ({remaining} bytes missing)"
            )));
        }
        if let Err(e) = framed.write_raw(&buf[..n]).await {
            warn!(
                peer = %peer,
                filename = %filename,
                sent = to_send - remaining,
                error = %e,
                "Send aborted"
            );
            return Err(e);
        }
        throughput.record(n);
        remaining -= n as u64;
    }
    throughput.finish();
    debug!(peer = %peer, filename = %filename, "Download complete");
    Ok(())
}

/// Opens `filename`, checks `offset` against its size and hashes it.
///
/// Size and digest are taken from the same handle that is later streamed,
/// so a concurrent overwrite cannot mix two versions.
async fn open_verified(
    storage: &Storage,
    filename: &str,
    offset: u64,
) -> Result<(fs::File, u64, String)> {
    let path = storage.path_of(filename);
    let mut file = match fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NotFound(filename.to_owned()));
        }
        Err(e) => return Err(e.into()),
    };

    let meta = file.metadata().await?;
    if !meta.is_file() {
        return Err(Error::NotFound(filename.to_owned()));
    }
    let filesize = meta.len();
    if offset > 0 && offset >= filesize {
        return Err(Error::InvalidRange { offset, filesize });
    }

    let hash = digest_reader(&mut file).await?;
    Ok((file, filesize, hash))
}
