use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail, ensure};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// ASCII magic bytes that open every DropVault frame.
const MAGIC: &[u8; 4] = b"DVLT";
/// Protocol version understood by this build.
const VERSION: u8 = 0x01;
/// Total header size: magic(4) + version(1) + type(1) + flags(2) + length(4).
pub const HEADER_LEN: usize = 12;
/// Upper bound on a single frame payload to protect against malicious peers.
///
/// Large enough for a `LIST` response over a few thousand files.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_TYPE: usize = 5;
const OFF_FLAGS: usize = 6;
const OFF_LENGTH: usize = 8;

/// Protocol-level frame type codes (v1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Client → server command (`UPLOAD`, `DOWNLOAD`, `LIST`).
    Request = 0x01,
    /// Server → client reply.
    Response = 0x02,
    /// Client → server readiness acknowledgment before a download payload.
    Ack = 0x03,
}

impl TryFrom<u8> for MessageType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Request),
            0x02 => Ok(Self::Response),
            0x03 => Ok(Self::Ack),
            other => bail!("unknown message type: 0x{other:02X}"),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(mt: MessageType) -> u8 {
        mt as u8
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub msg_type: MessageType,
    /// Reserved flags, must be `0x0000` in v1.
    pub flags: u16,
    pub payload_length: u32,
}

/// A fully decoded frame (header + payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Vec<u8>,
}

/// Attempts to decode one complete frame from the front of `buf`.
///
/// * `Ok(Some(frame))`: a full frame was present; its bytes have been consumed
///   from `buf`.
/// * `Ok(None)`: not enough bytes yet; `buf` is left untouched.  The caller
///   should read more data and try again.
/// * `Err(..)`: framing violation (bad magic, unsupported version, unknown
///   message type, oversized payload).  The stream cannot be resynchronised
///   and the caller should close the connection.
///
/// # Errors
///
/// Returns an error on framing violations: bad magic, unsupported version,
/// unknown message type, or payload exceeding [`MAX_PAYLOAD_LEN`].
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    ensure!(
        &buf[OFF_MAGIC..OFF_MAGIC + MAGIC.len()] == MAGIC,
        "bad magic: expected DVLT"
    );

    let version = buf[OFF_VERSION];
    ensure!(version == VERSION, "unsupported version: 0x{version:02X}");

    let msg_type = MessageType::try_from(buf[OFF_TYPE])?;

    let flags = u16::from_be_bytes(buf[OFF_FLAGS..OFF_FLAGS + 2].try_into()?);

    let payload_len = u32::from_be_bytes(buf[OFF_LENGTH..OFF_LENGTH + 4].try_into()?) as usize;

    ensure!(
        payload_len <= MAX_PAYLOAD_LEN,
        "payload too large: {payload_len} bytes (max {MAX_PAYLOAD_LEN})"
    );

    if buf.len() < HEADER_LEN + payload_len {
        return Ok(None);
    }

    buf.advance(HEADER_LEN);
    let payload = buf.split_to(payload_len).to_vec();

    let header = Header {
        version,
        msg_type,
        flags,
        #[allow(clippy::cast_possible_truncation)] // guarded by MAX_PAYLOAD_LEN (fits in u32)
        payload_length: payload_len as u32,
    };

    Ok(Some(Frame { header, payload }))
}

/// Encodes a frame into `buf`.
///
/// Appends the 12-byte header followed by `payload` to the buffer.
pub fn encode_frame(msg_type: MessageType, payload: &[u8], buf: &mut BytesMut) {
    buf.reserve(HEADER_LEN + payload.len());
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(msg_type.into());
    buf.put_u16(0x0000);
    #[allow(clippy::cast_possible_truncation)] // frame payloads are bounded by MAX_PAYLOAD_LEN
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
}

/// Convenience wrapper that allocates and returns a new `BytesMut`.
#[must_use]
pub fn encode_frame_to_bytes(msg_type: MessageType, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    encode_frame(msg_type, payload, &mut buf);
    buf
}

/// Encodes a serializable payload into a protocol frame stored in a new
/// [`BytesMut`].
///
/// # Errors
///
/// Returns an error if JSON serialization fails or the encoded payload
/// exceeds [`MAX_PAYLOAD_LEN`].
pub fn encode_payload_frame<T: Serialize>(msg_type: MessageType, payload: &T) -> Result<BytesMut> {
    let json = serde_json::to_vec(payload)?;
    ensure!(
        json.len() <= MAX_PAYLOAD_LEN,
        "payload too large: {} bytes (max {MAX_PAYLOAD_LEN})",
        json.len()
    );
    Ok(encode_frame_to_bytes(msg_type, &json))
}

/// Decodes a frame's payload bytes into the requested type.
///
/// # Errors
///
/// Returns an error if the payload is not valid JSON or does not match `T`.
pub fn decode_payload<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(Into::into)
}

// ── Handling mode ───────────────────────────────────────────────────

/// Policy applied when an upload targets a filename that already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlingMode {
    /// Replace the existing file in place.
    #[default]
    Overwrite,
    /// Store under the first free `name_vN.ext`.
    Rename,
    /// Archive the existing file, then replace it.
    Versioning,
}

impl HandlingMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Overwrite => "overwrite",
            Self::Rename => "rename",
            Self::Versioning => "versioning",
        }
    }
}

impl fmt::Display for HandlingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HandlingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "overwrite" => Ok(Self::Overwrite),
            "rename" => Ok(Self::Rename),
            "versioning" => Ok(Self::Versioning),
            other => Err(Error::Protocol(format!("unsupported handling mode: {other}"))),
        }
    }
}

// ── Requests (client → server) ──────────────────────────────────────

/// Body of an `UPLOAD` request.
///
/// Every field is optional on the wire so that a request with missing
/// metadata still parses and can be answered with a precise error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesize: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handling_mode: Option<String>,
}

/// Body of a `DOWNLOAD` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_offset: Option<u64>,
}

/// A command carried in a [`MessageType::Request`] frame, tagged by its
/// `command` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "UPPERCASE")]
pub enum Command {
    Upload(UploadRequest),
    Download(DownloadRequest),
    List,
}

impl Command {
    /// Wire name of the command, for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Upload(_) => "UPLOAD",
            Self::Download(_) => "DOWNLOAD",
            Self::List => "LIST",
        }
    }
}

const KNOWN_COMMANDS: [&str; 3] = ["UPLOAD", "DOWNLOAD", "LIST"];

/// Parses a request payload into a [`Command`].
///
/// Malformed JSON (or a known command whose fields have the wrong types)
/// and an unknown `command` value are distinguished so the server can
/// answer each with its own message while keeping the connection open.
///
/// # Errors
///
/// Returns [`Error::Protocol`] with `"Invalid request format"` or
/// `"Invalid command"`.
pub fn parse_request(payload: &[u8]) -> Result<Command, Error> {
    let invalid_format = || Error::Protocol("Invalid request format".into());

    let value: serde_json::Value = serde_json::from_slice(payload).map_err(|_| invalid_format())?;
    if !value.is_object() {
        return Err(invalid_format());
    }

    match value.get("command").and_then(serde_json::Value::as_str) {
        Some(name) if KNOWN_COMMANDS.contains(&name) => {
            serde_json::from_value(value).map_err(|_| invalid_format())
        }
        _ => Err(Error::Protocol("Invalid command".into())),
    }
}

/// Readiness acknowledgment sent in a [`MessageType::Ack`] frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyAck {
    pub status: Status,
}

impl ReadyAck {
    #[must_use]
    pub fn ready() -> Self {
        Self {
            status: Status::Ready,
        }
    }
}

// ── Responses (server → client) ─────────────────────────────────────

/// Outcome carried by every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ready,
    Success,
    Error,
}

/// Machine-readable failure class attached to error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Protocol,
    Integrity,
    Transfer,
    Timeout,
    NotFound,
    InvalidRange,
    Internal,
}

impl ErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Protocol => "protocol",
            Self::Integrity => "integrity",
            Self::Transfer => "transfer",
            Self::Timeout => "timeout",
            Self::NotFound => "not_found",
            Self::InvalidRange => "invalid_range",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata of one archived version, as reported by `LIST`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub filename: String,
    pub size: u64,
    pub modified: String,
}

/// Metadata of one active file, as reported by `LIST`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub filename: String,
    pub size: u64,
    pub modified: String,
    #[serde(default)]
    pub versions: Vec<VersionEntry>,
}

/// A server reply.
///
/// One flat document shape covers every step of every command; only the
/// fields relevant to a given step are present on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_duplicate: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handling_mode: Option<HandlingMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesize: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resuming_from: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileEntry>>,
}

impl Response {
    fn with_status(status: Status) -> Self {
        Self {
            status,
            code: None,
            message: None,
            filename: None,
            is_duplicate: None,
            handling_mode: None,
            filesize: None,
            hash: None,
            resuming_from: None,
            expected_hash: None,
            received_hash: None,
            files: None,
        }
    }

    /// An error response with an explicit code and message.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: Some(message.into()),
            ..Self::with_status(Status::Error)
        }
    }

    /// Builds the error response that reports `err` to the peer.
    #[must_use]
    pub fn from_error(err: &Error) -> Self {
        let mut response = Self::error(err.code(), err.to_string());
        if let Error::Integrity { expected, received } = err {
            response.message = Some("File corruption detected".into());
            response.expected_hash = Some(expected.clone());
            response.received_hash = Some(received.clone());
        }
        response
    }

    /// `UPLOAD` accepted: the server is ready for `filesize` payload bytes.
    #[must_use]
    pub fn upload_ready(filename: &str, is_duplicate: bool, mode: HandlingMode) -> Self {
        Self {
            filename: Some(filename.to_owned()),
            is_duplicate: Some(is_duplicate),
            handling_mode: Some(mode),
            ..Self::with_status(Status::Ready)
        }
    }

    /// `UPLOAD` payload received and verified.
    #[must_use]
    pub fn upload_complete(filename: &str, hash: &str) -> Self {
        Self {
            message: Some(format!("File {filename} uploaded successfully")),
            filename: Some(filename.to_owned()),
            hash: Some(hash.to_owned()),
            ..Self::with_status(Status::Success)
        }
    }

    /// `DOWNLOAD` accepted: `filesize - resuming_from` bytes follow the ack.
    #[must_use]
    pub fn download_ready(filesize: u64, hash: &str, resuming_from: u64) -> Self {
        Self {
            filesize: Some(filesize),
            hash: Some(hash.to_owned()),
            resuming_from: Some(resuming_from),
            ..Self::with_status(Status::Ready)
        }
    }

    /// `LIST` result.
    #[must_use]
    pub fn listing(files: Vec<FileEntry>) -> Self {
        Self {
            files: Some(files),
            ..Self::with_status(Status::Success)
        }
    }

    /// Converts an error response into the matching [`Error`], passing
    /// ready/success responses through.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Integrity`] for integrity failures reported with both
    /// digests, and [`Error::Rejected`] for every other error response.
    pub fn into_result(self) -> Result<Self, Error> {
        if self.status != Status::Error {
            return Ok(self);
        }

        let code = self.code.unwrap_or(ErrorCode::Internal);
        if let (ErrorCode::Integrity, Some(expected), Some(received)) =
            (code, &self.expected_hash, &self.received_hash)
        {
            return Err(Error::Integrity {
                expected: expected.clone(),
                received: received.clone(),
            });
        }

        Err(Error::Rejected {
            code,
            message: self.message.unwrap_or_else(|| "Unknown error".into()),
        })
    }
}
