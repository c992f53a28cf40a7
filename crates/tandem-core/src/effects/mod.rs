//! Pure effect interfaces
//!
//! The engine reaches the outside world only through these traits: a durable
//! key-value store, a transport to the counterparty, and a signer holding the
//! local key. Implementations live in `tandem-effects` (production) and
//! `tandem-testkit` (in-memory network).

pub mod signing;
pub mod storage;
pub mod transport;

pub use signing::SigningEffects;
pub use storage::{StorageEffects, StorageError};
pub use transport::TransportEffects;
