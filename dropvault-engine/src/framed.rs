//! Frame-level I/O over a [`Connection`].
//!
//! Control messages and raw file bytes share one stream. [`Framed`] keeps
//! whatever it has read past the end of the last frame and hands those
//! bytes out first from [`Framed::read_raw`], so a payload that arrives in
//! the same segment as its `ready` response is never lost.

use std::time::Duration;

use bytes::{Buf, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::trace;

use dropvault_core::protocol::{
    Frame, MessageType, Response, decode_payload, encode_payload_frame, try_decode_frame,
};
use dropvault_core::transport::Connection;
use dropvault_core::{Error, Result};

const READ_CHUNK: usize = 64 * 1024;

async fn bounded<T>(
    timeout: Duration,
    fut: impl Future<Output = anyhow::Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(Error::connection(&e)),
        Err(_) => Err(Error::Timeout),
    }
}

/// A [`Connection`] with a frame decoder and a per-operation timeout.
pub struct Framed<C> {
    conn: C,
    peer: String,
    buf: BytesMut,
    scratch: Box<[u8]>,
    timeout: Duration,
}

impl<C: Connection> Framed<C> {
    /// Wraps `conn`; every read and write is bounded by `timeout`.
    pub fn new(conn: C, timeout: Duration) -> Self {
        let peer = conn.peer();
        Self {
            conn,
            peer,
            buf: BytesMut::with_capacity(READ_CHUNK),
            scratch: vec![0u8; READ_CHUNK].into_boxed_slice(),
            timeout,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Reads the next complete frame.
    ///
    /// Returns `Ok(None)` on a clean close between frames.
    ///
    /// # Errors
    ///
    /// [`Error::Framing`] when the stream violates the frame format,
    /// [`Error::Connection`] when the peer closes mid-frame or the socket
    /// fails, [`Error::Timeout`] when no data arrives in time.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            match try_decode_frame(&mut self.buf) {
                Ok(Some(frame)) => {
                    trace!(
                        peer = %self.peer,
                        msg_type = ?frame.header.msg_type,
                        payload_len = frame.header.payload_length,
                        "Frame decoded"
                    );
                    return Ok(Some(frame));
                }
                Ok(None) => {}
                Err(e) => return Err(Error::Framing(format!("{e:#}"))),
            }

            let n = bounded(self.timeout, self.conn.read(&mut self.scratch)).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Connection(format!(
                    "connection closed with {} bytes of an incomplete frame",
                    self.buf.len()
                )));
            }
            self.buf.extend_from_slice(&self.scratch[..n]);
        }
    }

    /// Reads one frame of type `expected` and decodes its JSON payload.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] if the frame has another type or the payload
    /// does not decode, [`Error::Connection`] if the peer closed, and the
    /// errors of [`read_frame`](Self::read_frame).
    pub async fn read_message<T: DeserializeOwned>(&mut self, expected: MessageType) -> Result<T> {
        let frame = self
            .read_frame()
            .await?
            .ok_or_else(|| Error::Connection("connection closed by peer".into()))?;

        if frame.header.msg_type != expected {
            return Err(Error::Protocol(format!(
                "expected {expected:?} frame, got {:?}",
                frame.header.msg_type
            )));
        }
        decode_payload(&frame.payload)
            .map_err(|e| Error::Protocol(format!("invalid {expected:?} payload: {e:#}")))
    }

    /// Encodes `payload` as JSON and sends it in a frame of `msg_type`.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] if the payload cannot be encoded, otherwise the
    /// errors of [`write_raw`](Self::write_raw).
    pub async fn send<T: Serialize>(&mut self, msg_type: MessageType, payload: &T) -> Result<()> {
        let frame = encode_payload_frame(msg_type, payload)
            .map_err(|e| Error::Protocol(format!("{e:#}")))?;
        self.write_raw(&frame).await
    }

    /// Sends a [`MessageType::Response`] frame.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_response(&mut self, response: &Response) -> Result<()> {
        self.send(MessageType::Response, response).await
    }

    /// Reads unframed payload bytes into `out`, draining bytes buffered by
    /// the frame decoder first.
    ///
    /// Returns `Ok(0)` when the peer has closed the connection.
    ///
    /// # Errors
    ///
    /// [`Error::Connection`] on socket failure, [`Error::Timeout`] when no
    /// data arrives in time.
    pub async fn read_raw(&mut self, out: &mut [u8]) -> Result<usize> {
        if !self.buf.is_empty() {
            let n = out.len().min(self.buf.len());
            out[..n].copy_from_slice(&self.buf[..n]);
            self.buf.advance(n);
            return Ok(n);
        }
        bounded(self.timeout, self.conn.read(out)).await
    }

    /// Writes unframed bytes.
    ///
    /// # Errors
    ///
    /// [`Error::Connection`] on socket failure, [`Error::Timeout`] when the
    /// peer stops reading.
    pub async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        bounded(self.timeout, self.conn.write_all(data)).await
    }

    /// Shuts down the write half of the connection.
    ///
    /// # Errors
    ///
    /// See [`write_raw`](Self::write_raw).
    pub async fn shutdown(&mut self) -> Result<()> {
        bounded(self.timeout, self.conn.shutdown()).await
    }
}

#[cfg(test)]
mod tests {
    use dropvault_core::protocol::{ReadyAck, Status, encode_frame_to_bytes};

    use super::*;
    use crate::memory::{MemoryConnection, pair};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn framed_pair() -> (Framed<MemoryConnection>, Framed<MemoryConnection>) {
        let (a, b) = pair();
        (Framed::new(a, TIMEOUT), Framed::new(b, TIMEOUT))
    }

    #[tokio::test]
    async fn given_frame_split_into_single_bytes_when_read_then_decoded_whole() {
        let (mut tx, mut rx) = framed_pair();
        let bytes = encode_frame_to_bytes(MessageType::Request, br#"{"command":"LIST"}"#);

        let writer = tokio::spawn(async move {
            for byte in bytes.iter() {
                tx.write_raw(std::slice::from_ref(byte)).await.unwrap();
                tokio::task::yield_now().await;
            }
            tx
        });

        let frame = rx.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.header.msg_type, MessageType::Request);
        assert_eq!(frame.payload, br#"{"command":"LIST"}"#);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn given_payload_in_same_write_as_frame_when_read_raw_then_bytes_not_lost() {
        let (mut tx, mut rx) = framed_pair();
        let mut wire =
            encode_payload_frame(MessageType::Response, &Response::listing(vec![])).unwrap();
        wire.extend_from_slice(b"raw tail");
        tx.write_raw(&wire).await.unwrap();
        drop(tx);

        let response: Response = rx.read_message(MessageType::Response).await.unwrap();
        assert_eq!(response.status, Status::Success);

        let mut out = [0u8; 8];
        let mut got = 0;
        while got < out.len() {
            let n = rx.read_raw(&mut out[got..]).await.unwrap();
            assert_ne!(n, 0);
            got += n;
        }
        assert_eq!(&out, b"raw tail");
        assert_eq!(rx.read_raw(&mut out).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn given_clean_close_between_frames_when_read_then_none() {
        let (tx, mut rx) = framed_pair();
        drop(tx);
        assert!(rx.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn given_close_mid_frame_when_read_then_connection_error() {
        let (mut tx, mut rx) = framed_pair();
        let bytes = encode_frame_to_bytes(MessageType::Request, b"{}");
        tx.write_raw(&bytes[..5]).await.unwrap();
        drop(tx);
        assert!(matches!(rx.read_frame().await, Err(Error::Connection(_))));
    }

    #[tokio::test]
    async fn given_garbage_when_read_then_framing_error() {
        let (mut tx, mut rx) = framed_pair();
        tx.write_raw(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        assert!(matches!(rx.read_frame().await, Err(Error::Framing(_))));
    }

    #[tokio::test]
    async fn given_unexpected_frame_type_when_read_message_then_protocol_error() {
        let (mut tx, mut rx) = framed_pair();
        tx.send(MessageType::Ack, &ReadyAck::ready()).await.unwrap();
        let result = rx.read_message::<Response>(MessageType::Response).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn given_silent_peer_when_read_then_times_out() {
        let (a, b) = pair();
        let mut rx = Framed::new(a, Duration::from_millis(100));
        let _keep_open = b;
        assert!(matches!(rx.read_frame().await, Err(Error::Timeout)));
    }
}
