//! Tandem Effects - handlers for the core effect traits
//!
//! - `MemoryStorageHandler`: in-memory store for tests and ephemeral peers
//! - `FilesystemStorageHandler`: durable store (write, fsync, atomic rename)
//! - `Ed25519SigningHandler`: local key custody with address-derived
//!   verification

#![forbid(unsafe_code)]

pub mod signing;
pub mod storage;

pub use signing::Ed25519SigningHandler;
pub use storage::{FilesystemStorageHandler, MemoryStorageHandler};
