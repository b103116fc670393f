//! # dropvault-engine
//!
//! Runtime logic for DropVault, embedded into the `dropvault` binary.
//!
//! This crate provides:
//! - **Server**: an accept loop driven by commands and observed through
//!   events, bounded by a connection semaphore, running one session task per
//!   connection
//! - **Session handling**: request dispatch and the upload, download and
//!   list handlers over any transport (`Connection` trait)
//! - **Client**: connect, retry, upload, resumable download and listing,
//!   reporting progress as events
//! - **Transport implementations**: TCP, plus an in-memory pipe in tests

pub mod client;
pub mod framed;
pub mod handlers;
#[cfg(test)]
mod memory;
pub mod message_processor;
pub mod server;
pub mod session;
pub mod tcp;
