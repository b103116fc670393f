use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, broadcast, mpsc};
use tracing::{debug, info, warn};

use dropvault_core::storage::DEFAULT_VERSIONS_DIR;
use dropvault_core::transport::{Connection, Listener, ListenerFactory};

use crate::session::{DEFAULT_CHUNK_SIZE, DEFAULT_OPERATION_TIMEOUT, SessionConfig, SessionHandler};
use crate::tcp::DEFAULT_BACKLOG;

/// Default ceiling on concurrently served connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

// ── Server commands (UI → server) ───────────────────────────────────

/// Commands sent by the CLI to control the server.
#[derive(Clone, Debug)]
pub enum ServerCmd {
    /// Bind a listener on `addr` and start accepting connections.
    StartAccepting { addr: String },
    /// Stop accepting new connections (drop the listener). Sessions in
    /// flight run to completion.
    StopAccepting,
    /// Stop the accept loop for good.
    ShutDown,
}

// ── Server events (server → UI) ─────────────────────────────────────

/// Events emitted by the server for the CLI to observe.
#[derive(Clone, Debug)]
pub enum ServerEvent {
    /// The listener is bound and accepting connections on `addr`.
    Accepting { addr: String },
    /// The listener has been stopped.
    AcceptingStopped,
    /// A connection was accepted and handed to a session task.
    SessionStarted { session_id: u64, peer: String },
    /// A session task finished.
    SessionClosed { session_id: u64 },
    /// A non-fatal error occurred inside the server.
    Error { message: String },
}

// ── Server handle ───────────────────────────────────────────────────

/// Handle returned by [`Server::start`].  Lets the caller send commands
/// and subscribe to events.
pub struct ServerHandle {
    pub cmd_tx: mpsc::Sender<ServerCmd>,
    pub events_tx: broadcast::Sender<ServerEvent>,
}

// ── Configuration ───────────────────────────────────────────────────

/// Server configuration, built by the CLI and injected at start-up.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Directory holding the active files.
    pub storage_root: PathBuf,
    /// Directory holding archived versions; `<storage_root>/version_history`
    /// when unset.
    pub versions_dir: Option<PathBuf>,
    pub operation_timeout: Duration,
    pub backlog: u32,
    pub max_connections: usize,
    pub chunk_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("server_storage"),
            versions_dir: None,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            backlog: DEFAULT_BACKLOG,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ServerConfig {
    /// Resolved versions root.
    #[must_use]
    pub fn versions_root(&self) -> PathBuf {
        self.versions_dir
            .clone()
            .unwrap_or_else(|| self.storage_root.join(DEFAULT_VERSIONS_DIR))
    }

    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            operation_timeout: self.operation_timeout,
            chunk_size: self.chunk_size,
        }
    }
}

// ── Server ──────────────────────────────────────────────────────────

/// The DropVault server.
///
/// Accepts inbound connections and runs each one in its own task through
/// the [`SessionHandler`]. At most `max_connections` sessions run at once;
/// the accept loop waits for a free slot before accepting the next peer,
/// leaving further peers queued in the listen backlog.
pub struct Server;

impl Server {
    /// Spawn the server event loop and return a handle to control it.
    ///
    /// The server starts idle: no listener is active until a
    /// [`ServerCmd::StartAccepting`] arrives.
    pub fn start<F, H>(factory: F, handler: H, max_connections: usize) -> ServerHandle
    where
        F: ListenerFactory,
        H: SessionHandler<<F::L as Listener>::Conn>,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel::<ServerCmd>(32);
        let (events_tx, _) = broadcast::channel::<ServerEvent>(128);

        let events = events_tx.clone();

        info!(max_connections, "Spawning server event loop");

        tokio::spawn(run_server_loop(
            factory,
            Arc::new(handler),
            Arc::new(Semaphore::new(max_connections.max(1))),
            cmd_rx,
            events,
        ));

        ServerHandle { cmd_tx, events_tx }
    }
}

/// The main server event loop, extracted as a standalone async fn so that
/// the generic bounds don't infect `Server` itself.
async fn run_server_loop<F, H>(
    factory: F,
    handler: Arc<H>,
    slots: Arc<Semaphore>,
    mut cmd_rx: mpsc::Receiver<ServerCmd>,
    events: broadcast::Sender<ServerEvent>,
) where
    F: ListenerFactory,
    H: SessionHandler<<F::L as Listener>::Conn>,
{
    debug!("Server event loop running");

    let mut listener: Option<F::L> = None;
    let mut next_session_id: u64 = 1;

    loop {
        tokio::select! {
            biased;

            // ── Commands ────────────────────────────────────────
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ServerCmd::StartAccepting { addr }) => {
                        info!(addr = %addr, "Received StartAccepting command");
                        match factory.bind(&addr).await {
                            Ok(l) => {
                                let bound_addr = l.local_addr();
                                info!(addr = %bound_addr, "Listener bound");
                                listener = Some(l);
                                let _ = events.send(ServerEvent::Accepting {
                                    addr: bound_addr,
                                });
                            }
                            Err(e) => {
                                warn!(error = %format!("{e:#}"), "Failed to bind listener");
                                let _ = events.send(ServerEvent::Error {
                                    message: format!("{e:#}"),
                                });
                            }
                        }
                    }

                    Some(ServerCmd::StopAccepting) => {
                        info!("Received StopAccepting command");
                        listener = None;
                        let _ = events.send(ServerEvent::AcceptingStopped);
                    }

                    Some(ServerCmd::ShutDown) => {
                        info!("Received ShutDown command");
                        break;
                    }

                    None => {
                        debug!("Command channel closed, shutting down");
                        break;
                    }
                }
            }

            // ── Accept inbound connections ───────────────────────
            result = async {
                let permit = Arc::clone(&slots)
                    .acquire_owned()
                    .await
                    .map_err(anyhow::Error::from)?;
                match listener.as_mut() {
                    Some(l) => l.accept().await.map(|conn| (conn, permit)),
                    None => std::future::pending().await,
                }
            }, if listener.is_some() => {
                match result {
                    Ok((conn, permit)) => {
                        let peer = Connection::peer(&conn);
                        let session_id = next_session_id;
                        next_session_id += 1;

                        info!(session_id, peer = %peer, "Connection accepted");
                        let _ = events.send(ServerEvent::SessionStarted {
                            session_id,
                            peer,
                        });

                        let handler = Arc::clone(&handler);
                        let events = events.clone();
                        tokio::spawn(async move {
                            handler.handle(session_id, conn).await;
                            drop(permit);
                            let _ = events.send(ServerEvent::SessionClosed { session_id });
                        });
                    }
                    Err(e) => {
                        warn!(error = %format!("{e:#}"), "Failed to accept connection");
                        let _ = events.send(ServerEvent::Error {
                            message: format!("{e:#}"),
                        });
                    }
                }
            }
        }
    }

    info!("Server event loop stopped");
}

// ── Tests ───────────────────────────────────────────────────────────
