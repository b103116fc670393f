//! Client side of the DropVault protocol.
//!
//! A [`Client`] owns at most one connection and runs one operation at a
//! time. Transient failures (timeouts, dropped connections) are retried on
//! a fresh connection; downloads additionally resume from the last byte
//! written to disk.

mod download;
mod progress;
mod upload;

use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use dropvault_core::protocol::{
    Command, FileEntry, HandlingMode, MessageType, Response, VersionEntry,
};
use dropvault_core::transport::Connector;
use dropvault_core::{Error, Result};

pub use download::DownloadReport;
pub use upload::UploadReport;

use crate::framed::Framed;
use crate::session::{DEFAULT_CHUNK_SIZE, DEFAULT_OPERATION_TIMEOUT};

/// Client configuration, built by the CLI and injected at construction.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Server address as `host:port`.
    pub addr: String,
    /// Directory downloads are written to.
    pub download_dir: PathBuf,
    pub connect_timeout: Duration,
    /// Bound on every read and write once connected.
    pub operation_timeout: Duration,
    /// Extra attempts for a request/response exchange after a transient
    /// failure.
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Consecutive resumes without progress before a download gives up.
    pub max_resume_attempts: u32,
    pub chunk_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: "localhost:5000".into(),
            download_dir: PathBuf::from("client_downloads"),
            connect_timeout: Duration::from_secs(30),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            max_retries: 2,
            retry_delay: Duration::from_secs(1),
            max_resume_attempts: 3,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Events emitted while a client operation runs.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    Connected {
        addr: String,
    },
    /// A request failed transiently and will be retried.
    Retrying {
        attempt: u32,
        max_retries: u32,
        reason: String,
    },
    Reconnected {
        addr: String,
    },
    /// The server stored an upload under a different name or replaced an
    /// existing file.
    DuplicateResolved {
        requested: String,
        stored_as: String,
        mode: HandlingMode,
    },
    Progress {
        filename: String,
        bytes_transferred: u64,
        total_bytes: u64,
        bytes_per_sec: f64,
    },
    /// A download broke off and is being resumed at `offset`.
    Resuming {
        filename: String,
        offset: u64,
        attempt: u32,
    },
    /// All bytes arrived; the digest is being checked.
    Verifying {
        filename: String,
    },
}

/// A DropVault client over any [`Connector`].
pub struct Client<K: Connector> {
    connector: K,
    config: ClientConfig,
    conn: Option<Framed<K::Conn>>,
    events: Option<mpsc::UnboundedSender<ClientEvent>>,
}

impl<K: Connector> Client<K> {
    pub fn new(connector: K, config: ClientConfig) -> Self {
        Self {
            connector,
            config,
            conn: None,
            events: None,
        }
    }

    /// Publishes [`ClientEvent`]s on `tx` for the lifetime of the client.
    #[must_use]
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<ClientEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    fn emit(&self, event: ClientEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn framed(&mut self) -> Result<&mut Framed<K::Conn>> {
        self.conn.as_mut().ok_or(Error::NotConnected)
    }

    /// Opens a connection to the configured server, replacing any open one.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectRefused`] when nothing listens on the address,
    /// [`Error::ConnectTimeout`] when the attempt exceeds the connect
    /// timeout, [`Error::Connect`] otherwise.
    pub async fn connect(&mut self) -> Result<()> {
        self.close().await;
        let addr = self.config.addr.clone();
        debug!(addr = %addr, "Connecting");

        let conn = match tokio::time::timeout(
            self.config.connect_timeout,
            self.connector.connect(&addr),
        )
        .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(classify_connect_error(addr, &e)),
            Err(_) => return Err(Error::ConnectTimeout { addr }),
        };

        info!(addr = %addr, "Connected to server");
        self.conn = Some(Framed::new(conn, self.config.operation_timeout));
        self.emit(ClientEvent::Connected { addr });
        Ok(())
    }

    /// Connects unless a connection is already open.
    ///
    /// # Errors
    ///
    /// See [`connect`](Self::connect).
    pub async fn ensure_connected(&mut self) -> Result<()> {
        if self.conn.is_none() {
            self.connect().await?;
        }
        Ok(())
    }

    /// Closes the connection, if any.
    pub async fn close(&mut self) {
        if let Some(mut framed) = self.conn.take() {
            if let Err(e) = framed.shutdown().await {
                debug!(error = %e, "Shutdown failed");
            }
            debug!(peer = %framed.peer(), "Connection closed");
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.connect().await?;
        self.emit(ClientEvent::Reconnected {
            addr: self.config.addr.clone(),
        });
        Ok(())
    }

    async fn try_exchange(&mut self, command: &Command) -> Result<Response> {
        let framed = self.framed()?;
        framed.send(MessageType::Request, command).await?;
        framed.read_message(MessageType::Response).await
    }

    /// Sends one request and reads its response.
    ///
    /// On a transient failure the exchange is retried up to `max_retries`
    /// times, each time on a fresh connection after `retry_delay`. Once
    /// retries run out the connection is re-opened one last time and the
    /// failure is returned. Error responses are returned as-is; see
    /// [`Response::into_result`].
    ///
    /// # Errors
    ///
    /// The last transient error once retries are exhausted, or the first
    /// non-transient one.
    pub async fn exchange(&mut self, command: &Command) -> Result<Response> {
        self.ensure_connected().await?;
        let max_retries = self.config.max_retries;
        let mut attempt = 0;

        loop {
            let err = match self.try_exchange(command).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempt < max_retries => e,
                Err(e) => {
                    if e.is_transient() {
                        warn!(
                            command = command.name(),
                            max_retries,
                            error = %e,
                            "Request failed after retries"
                        );
                        // Leave a usable connection behind for the next call.
                        self.close().await;
                        if let Err(reconnect) = self.reconnect().await {
                            debug!(error = %reconnect, "Final reconnect failed");
                        }
                    }
                    return Err(e);
                }
            };

            attempt += 1;
            warn!(
                command = command.name(),
                attempt,
                max_retries,
                error = %err,
                "Request failed, retrying"
            );
            self.emit(ClientEvent::Retrying {
                attempt,
                max_retries,
                reason: err.to_string(),
            });
            self.close().await;
            tokio::time::sleep(self.config.retry_delay).await;
            self.reconnect().await?;
        }
    }

    /// Lists the files stored on the server.
    ///
    /// # Errors
    ///
    /// Connection errors, or [`Error::Rejected`] if the server refuses.
    pub async fn list(&mut self) -> Result<Vec<FileEntry>> {
        let response = self.exchange(&Command::List).await?.into_result()?;
        Ok(response.files.unwrap_or_default())
    }

    /// Lists the archived versions of `filename`, newest first.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the server has no active file of that name,
    /// plus the errors of [`list`](Self::list).
    pub async fn versions(&mut self, filename: &str) -> Result<Vec<VersionEntry>> {
        self.list()
            .await?
            .into_iter()
            .find(|entry| entry.filename == filename)
            .map(|entry| entry.versions)
            .ok_or_else(|| Error::NotFound(filename.to_owned()))
    }
}

/// Maps a connector failure onto the connect error taxonomy by the I/O
/// error kind found in its chain.
fn classify_connect_error(addr: String, err: &anyhow::Error) -> Error {
    let kind = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<std::io::Error>())
        .map(std::io::Error::kind);

    match kind {
        Some(ErrorKind::ConnectionRefused) => Error::ConnectRefused { addr },
        Some(ErrorKind::TimedOut) => Error::ConnectTimeout { addr },
        _ => Error::Connect {
            addr,
            message: format!("{err:#}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn given_refused_io_error_in_chain_when_classified_then_connect_refused() {
        let err = Err::<(), _>(std::io::Error::from(ErrorKind::ConnectionRefused))
            .context("failed to connect to localhost:1")
            .unwrap_err();
        assert!(matches!(
            classify_connect_error("localhost:1".into(), &err),
            Error::ConnectRefused { .. }
        ));
    }

    #[test]
    fn given_other_error_when_classified_then_generic_connect_error_keeps_chain() {
        let err = anyhow::anyhow!("no such host").context("failed to connect to nowhere:1");
        let Error::Connect { message, .. } = classify_connect_error("nowhere:1".into(), &err) else {
            panic!("expected a generic connect error");
        };
        assert!(message.contains("no such host"));
    }
}
