use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net;
use tracing::{debug, info};

use dropvault_core::transport::{Connection, Connector, Listener, ListenerFactory};

/// Pending-connection queue length used when none is configured.
pub const DEFAULT_BACKLOG: u32 = 128;

/// A TCP connection wrapping a [`tokio::net::TcpStream`].
pub struct TcpConnection {
    stream: net::TcpStream,
    peer_addr: String,
}

impl TcpConnection {
    fn new(stream: net::TcpStream, peer_addr: String) -> Self {
        // Control frames are small; don't let Nagle hold them back.
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
        }
        Self { stream, peer_addr }
    }

    /// Returns a shared reference to the underlying stream.
    pub fn stream(&self) -> &net::TcpStream {
        &self.stream
    }
}

impl Connection for TcpConnection {
    fn peer(&self) -> String {
        self.peer_addr.clone()
    }

    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a {
        async move {
            self.stream
                .read(buf)
                .await
                .context("failed to read from TCP connection")
        }
    }

    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            self.stream
                .write_all(buf)
                .await
                .context("failed to write to TCP connection")
        }
    }

    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_ {
        async move {
            self.stream
                .shutdown()
                .await
                .context("failed to shut down TCP connection")
        }
    }
}

/// A TCP listener wrapping a [`tokio::net::TcpListener`].
pub struct TcpListener {
    inner: net::TcpListener,
    local_addr: String,
}

impl Listener for TcpListener {
    type Conn = TcpConnection;

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }

    fn accept(&mut self) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + '_ {
        async move {
            let (stream, addr) = self
                .inner
                .accept()
                .await
                .context("failed to accept TCP connection")?;
            let peer_addr = addr.to_string();
            debug!(peer = %peer_addr, "Accepted TCP connection");
            Ok(TcpConnection::new(stream, peer_addr))
        }
    }
}

/// Factory that binds [`TcpListener`] instances with `SO_REUSEADDR` and a
/// bounded backlog.
pub struct TcpListenerFactory {
    backlog: u32,
}

impl TcpListenerFactory {
    #[must_use]
    pub fn with_backlog(backlog: u32) -> Self {
        Self { backlog }
    }
}

impl Default for TcpListenerFactory {
    fn default() -> Self {
        Self::with_backlog(DEFAULT_BACKLOG)
    }
}

impl ListenerFactory for TcpListenerFactory {
    type L = TcpListener;

    fn bind<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::L>> + Send + 'a {
        async move {
            let sock_addr = net::lookup_host(addr)
                .await
                .with_context(|| format!("failed to resolve listen address {addr}"))?
                .next()
                .with_context(|| format!("no socket address for {addr}"))?;

            let socket = if sock_addr.is_ipv4() {
                net::TcpSocket::new_v4()
            } else {
                net::TcpSocket::new_v6()
            }
            .context("failed to create TCP socket")?;
            socket
                .set_reuseaddr(true)
                .context("failed to set SO_REUSEADDR")?;
            socket
                .bind(sock_addr)
                .with_context(|| format!("failed to bind TCP listener on {addr}"))?;
            let inner = socket
                .listen(self.backlog)
                .with_context(|| format!("failed to listen on {addr}"))?;

            let local_addr = inner
                .local_addr()
                .context("failed to retrieve local address")?
                .to_string();
            info!(addr = %local_addr, backlog = self.backlog, "TCP listener bound");
            Ok(TcpListener { inner, local_addr })
        }
    }
}

/// Opens outbound [`TcpConnection`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Conn = TcpConnection;

    fn connect<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + 'a {
        async move {
            let stream = net::TcpStream::connect(addr)
                .await
                .with_context(|| format!("failed to connect to {addr}"))?;
            let peer_addr = stream
                .peer_addr()
                .map_or_else(|_| addr.to_owned(), |a| a.to_string());
            debug!(peer = %peer_addr, "TCP connection established");
            Ok(TcpConnection::new(stream, peer_addr))
        }
    }
}
