//! Durable key-value storage interface

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Storage operation errors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum StorageError {
    /// Reading a key failed
    #[error("Read failed: {0}")]
    ReadFailed(String),

    /// Writing a key failed
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Deleting a key failed
    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    /// Key is not acceptable for this backend
    #[error("Invalid key: {reason}")]
    InvalidKey {
        /// Why the key was rejected
        reason: String,
    },
}

/// Durable key-value store
///
/// `store` and `compare_and_swap` must not return before the write is
/// durable: a crash right after they return may not lose the update.
#[async_trait]
pub trait StorageEffects: Send + Sync {
    /// Insert or overwrite `key`
    async fn store(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    /// Fetch `key`; an absent key is `Ok(None)`, never an error
    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Delete `key`, returning whether it existed
    async fn remove(&self, key: &str) -> Result<bool, StorageError>;

    /// List keys, optionally restricted to a prefix, in sorted order
    async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StorageError>;

    /// Replace `key` only if its current value equals `expected`
    ///
    /// `expected = None` means "key must be absent"; `new = None` deletes the
    /// key. Returns `false` without writing when the precondition fails.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<bool, StorageError>;
}
