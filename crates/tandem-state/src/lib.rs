//! Tandem State - the Channel State Store
//!
//! Canonical per-channel state: the free balance, every installed app
//! channel, and the shared dependency nonce. Protocols never touch it
//! directly; they stage a `StagedTransition` and the engine hands it to
//! `ChannelStateStore::commit`, the only mutation entry point.
//!
//! Invariants enforced on every commit:
//! - an app's `local_nonce` starts at 1 and grows by exactly 1 per update
//! - install/uninstall bump the channel's dependency nonce by exactly 1
//! - app ids are unique within a channel
//! - balances never go negative; value is conserved except for the explicit
//!   settlement transfer of an uninstall
//! - `app_state_hash` always matches `encoded_state`

#![forbid(unsafe_code)]

pub mod channel;
pub mod error;
pub mod invariants;
pub mod store;
pub mod transition;

pub use channel::{AppChannelState, ChannelState, DependencyNonce, FreeBalanceState, PeerBalance};
pub use error::StateError;
pub use store::{ChannelStateStore, CommitReceipt};
pub use transition::StagedTransition;
