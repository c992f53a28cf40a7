//! Tandem Core - shared vocabulary for the two-party channel engine
//!
//! This crate holds the types every other layer speaks in and nothing that
//! performs I/O on its own:
//!
//! - identifiers (`Address`, `AppId`, `RequestId`) and binary values
//!   (`Digest`, `Signature`)
//! - `AppState` and its canonical encoding / state hash
//! - wire messages exchanged between counterparties (`ClientActionMessage`)
//! - effect interfaces for storage, transport and signing
//! - engine configuration
//!
//! Handlers for the effect traits live in `tandem-effects`.

#![forbid(unsafe_code)]

// === Core Modules ===

/// Application state encoding and hashing
pub mod app;

/// Engine configuration (namespaces, WAL layout)
pub mod config;

/// Pure effect interfaces (no implementations)
pub mod effects;

/// Unified error handling
pub mod errors;

/// Addresses, app ids, request ids, digests and signatures
pub mod identifiers;

/// Wire messages exchanged between the two counterparties
pub mod messages;

// === Public API Re-exports ===

pub use app::AppState;
pub use config::{EngineConfig, StateConfig, WalConfig, WalLayout};
pub use effects::{SigningEffects, StorageEffects, StorageError, TransportEffects};
pub use errors::{Result, TandemError};
pub use identifiers::{Address, AppId, Digest, RequestId, Signature};
pub use messages::{
    ClientActionMessage, InstallParams, ProtocolName, ProtocolPayload, UninstallParams,
    UpdateParams,
};
