//! # dropvault-core
//!
//! Shared building blocks for the DropVault file transfer protocol.
//!
//! This crate provides the foundational types used by `dropvault-engine`
//! and the `dropvault` binary.
//!
//! ## Responsibilities
//!
//! - **Protocol primitives**: frame format (magic / version / type / length),
//!   request and response messages, and JSON payload encoding/decoding.
//!
//! - **Integrity**: streaming SHA-256 over files and byte streams.
//!
//! - **Storage**: filename validation, duplicate handling (overwrite,
//!   rename, versioning), staged writes with atomic rename, and the
//!   version archive.
//!
//! - **Transport traits**: the connection/listener/connector seams the
//!   engine is generic over.

pub mod digest;
pub mod error;
pub mod protocol;
pub mod storage;
pub mod transport;

pub use error::{Error, Result};
