//! Error types shared by the DropVault server and client.

use thiserror::Error;

use crate::protocol::ErrorCode;

/// Main error type for DropVault operations.
///
/// Every variant maps onto a wire [`ErrorCode`] so that a server-side
/// failure can always be reported to the peer as a well-formed response.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed request, missing fields, or an unexpected message.
    #[error("{0}")]
    Protocol(String),

    /// The received bytes do not hash to the declared digest.
    #[error("file corruption detected (expected hash {expected}, received hash {received})")]
    Integrity { expected: String, received: String },

    /// The payload stream ended early or could not be stored.
    #[error("file transfer error: {0}")]
    Transfer(String),

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// The requested file does not exist.
    #[error("file not found: {0}")]
    NotFound(String),

    /// A resume offset outside `0..filesize`.
    #[error("invalid resume offset {offset} for a file of {filesize} bytes")]
    InvalidRange { offset: u64, filesize: u64 },

    /// The server answered with an error response.
    #[error("{message} ({code})")]
    Rejected { code: ErrorCode, message: String },

    /// Nothing is listening on the target address.
    #[error("connection refused: server at {addr} is not running or the port is incorrect")]
    ConnectRefused { addr: String },

    /// The connect attempt did not complete within the connect timeout.
    #[error("connection timed out: server at {addr} is not responding")]
    ConnectTimeout { addr: String },

    /// Any other connect failure.
    #[error("connection to {addr} failed: {message}")]
    Connect { addr: String, message: String },

    /// An operation needed a connection and none was open.
    #[error("not connected to server")]
    NotConnected,

    /// Socket-level fault or unexpected close on an established connection.
    #[error("connection error: {0}")]
    Connection(String),

    /// The byte stream violates the frame format and cannot be resynchronised.
    #[error("framing error: {0}")]
    Framing(String),

    /// Local filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wraps a transport error raised on an established connection.
    pub fn connection(err: &anyhow::Error) -> Self {
        Self::Connection(format!("{err:#}"))
    }

    /// Wire code reported to the peer for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Protocol(_) | Self::Framing(_) => ErrorCode::Protocol,
            Self::Integrity { .. } => ErrorCode::Integrity,
            Self::Transfer(_) | Self::Connection(_) => ErrorCode::Transfer,
            Self::Timeout | Self::ConnectTimeout { .. } => ErrorCode::Timeout,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::InvalidRange { .. } => ErrorCode::InvalidRange,
            Self::Rejected { code, .. } => *code,
            Self::ConnectRefused { .. }
            | Self::Connect { .. }
            | Self::NotConnected
            | Self::Io(_) => ErrorCode::Internal,
        }
    }

    /// Returns true if this error is transient and retrying on a fresh
    /// connection may help.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Connection(_))
    }
}

/// Result alias defaulting to [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;
