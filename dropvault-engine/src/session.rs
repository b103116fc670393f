use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use dropvault_core::Error;
use dropvault_core::protocol::{ErrorCode, Response};
use dropvault_core::storage::Storage;
use dropvault_core::transport::Connection;

use crate::framed::Framed;
use crate::message_processor::process_frame;

/// Default bound on every read and write of a session.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(300);
/// Default size of file chunks read from disk or the socket.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Trait for handling accepted connections.
///
/// The server calls [`handle`](SessionHandler::handle) for every inbound
/// connection, each in its own spawned task.
///
/// Wrap shared state in the implementor itself: the server clones an
/// `Arc<H>` for every spawned task.
pub trait SessionHandler<C: Connection>: Send + Sync + 'static {
    fn handle(&self, session_id: u64, conn: C) -> impl Future<Output = ()> + Send;
}

/// Per-session knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub operation_timeout: Duration,
    pub chunk_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Serves `UPLOAD`, `DOWNLOAD` and `LIST` requests against a [`Storage`].
pub struct FileSessionHandler {
    storage: Arc<Storage>,
    config: SessionConfig,
}

impl FileSessionHandler {
    #[must_use]
    pub fn new(storage: Arc<Storage>, config: SessionConfig) -> Self {
        Self { storage, config }
    }
}

impl<C: Connection> SessionHandler<C> for FileSessionHandler {
    async fn handle(&self, session_id: u64, conn: C) {
        let mut framed = Framed::new(conn, self.config.operation_timeout);
        let peer = framed.peer().to_owned();
        info!(session_id, peer = %peer, "Session started");

        loop {
            let frame = match framed.read_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!(session_id, peer = %peer, "Connection closed by peer");
                    break;
                }
                Err(Error::Framing(reason)) => {
                    // The stream cannot be resynchronised; report and close.
                    warn!(
                        session_id,
                        peer = %peer,
                        error = %reason,
                        "Protocol error, closing connection"
                    );
                    let _ = framed
                        .send_response(&Response::error(ErrorCode::Protocol, reason))
                        .await;
                    break;
                }
                Err(Error::Timeout) => {
                    warn!(
                        session_id,
                        peer = %peer,
                        "Timed out waiting for a request, closing connection"
                    );
                    break;
                }
                Err(e) => {
                    warn!(session_id, peer = %peer, error = %e, "Read error, closing connection");
                    break;
                }
            };

            if let Err(e) = process_frame(&self.storage, &self.config, &mut framed, frame).await {
                warn!(session_id, peer = %peer, error = %e, "Closing connection");
                break;
            }
        }

        if let Err(e) = framed.shutdown().await {
            debug!(session_id, peer = %peer, error = %e, "Shutdown failed");
        }
        info!(session_id, peer = %peer, "Session ended");
    }
}
