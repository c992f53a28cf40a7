//! Tandem Testing Infrastructure
//!
//! Deterministic building blocks for exercising two engines against each
//! other: fixed keys and app states, an in-memory network that delivers on
//! demand or from a background router, a store wrapper that fails writes on
//! cue, and a harness that can crash and restart either peer over its
//! surviving store.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

pub mod fixtures;
pub mod harness;
pub mod network;
pub mod storage;

pub use fixtures::*;
pub use harness::{Party, TwoPartyHarness};
pub use network::{Delivery, MemoryNetwork, MemoryTransport};
pub use storage::FaultyStorage;

/// Install a test-friendly tracing subscriber once per process
///
/// Honours `RUST_LOG`; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
