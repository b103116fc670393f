//! Streaming SHA-256 computation.

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Buffer size used when hashing files from disk.
const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Running SHA-256 over a byte stream that arrives in pieces.
#[derive(Debug, Clone, Default)]
pub struct DigestAccumulator {
    hasher: Sha256,
    bytes: u64,
}

impl DigestAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds the next piece of the stream.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    /// Number of bytes fed so far.
    #[must_use]
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    /// Consumes the accumulator and returns the lower-case hex digest.
    #[must_use]
    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Hex SHA-256 of an in-memory buffer.
#[must_use]
pub fn digest_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hex SHA-256 of everything `reader` yields until EOF.
///
/// # Errors
///
/// Propagates read errors.
pub async fn digest_reader<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<String> {
    let mut acc = DigestAccumulator::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        acc.update(&buf[..n]);
    }
    Ok(acc.finalize())
}

/// Hex SHA-256 of the file at `path`, read in bounded chunks.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub async fn digest_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    digest_reader(&mut file).await
}
