//! In-memory transport over [`tokio::io::duplex`], used by tests.

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use dropvault_core::transport::Connection;

/// Buffer size of each direction of a [`pair`].
const PIPE_CAPACITY: usize = 256 * 1024;

/// One end of an in-memory pipe.
pub struct MemoryConnection {
    stream: DuplexStream,
    peer: String,
}

/// Returns two connected ends, named `client` and `server` for logging.
#[must_use]
pub fn pair() -> (MemoryConnection, MemoryConnection) {
    let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
    (
        MemoryConnection {
            stream: a,
            peer: "memory:server".into(),
        },
        MemoryConnection {
            stream: b,
            peer: "memory:client".into(),
        },
    )
}

impl Connection for MemoryConnection {
    fn peer(&self) -> String {
        self.peer.clone()
    }

    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a {
        async move {
            self.stream
                .read(buf)
                .await
                .context("failed to read from in-memory connection")
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
                .context("failed to write to in-memory connection")
        }
    }

    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_ {
        async move {
            self.stream
                .shutdown()
                .await
                .context("failed to shut down in-memory connection")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn given_pair_when_one_end_writes_then_other_reads() {
        let (mut client, mut server) = pair();
        client.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hi");
    }

    #[tokio::test]
    async fn given_pair_when_one_end_dropped_then_other_reads_eof() {
        let (client, mut server) = pair();
        drop(client);
        let mut buf = [0u8; 8];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }
}
