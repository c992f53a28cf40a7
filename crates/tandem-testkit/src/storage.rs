//! Store wrapper with injectable write failures
//!
//! Writes to keys under a prefix draw from a budget; once it is spent every
//! such write fails until `heal` is called. Pointing the prefix at the WAL
//! namespace stops an engine exactly after its n-th log write, which is how
//! the crash tests freeze a cursor at a chosen step.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tandem_core::{StorageEffects, StorageError};

/// Storage handler that fails writes on cue
pub struct FaultyStorage {
    inner: Arc<dyn StorageEffects>,
    prefix: String,
    budget: Mutex<Option<usize>>,
}

impl FaultyStorage {
    /// Wrap `inner`, guarding writes to keys starting with `prefix`
    pub fn new(inner: Arc<dyn StorageEffects>, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
            budget: Mutex::new(None),
        }
    }

    /// Allow `writes` more guarded writes, then fail the rest
    pub fn fail_after(&self, writes: usize) {
        *self.budget.lock() = Some(writes);
    }

    /// Stop failing
    pub fn heal(&self) {
        *self.budget.lock() = None;
    }

    fn admit(&self, key: &str) -> Result<(), StorageError> {
        if !key.starts_with(&self.prefix) {
            return Ok(());
        }
        let mut budget = self.budget.lock();
        match budget.as_mut() {
            None => Ok(()),
            Some(0) => Err(StorageError::WriteFailed(format!(
                "injected fault writing {key}"
            ))),
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl StorageEffects for FaultyStorage {
    async fn store(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.admit(key)?;
        self.inner.store(key, value).await
    }

    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.retrieve(key).await
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        self.admit(key)?;
        self.inner.remove(key).await
    }

    async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StorageError> {
        self.inner.list_keys(prefix).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<bool, StorageError> {
        self.admit(key)?;
        self.inner.compare_and_swap(key, expected, new).await
    }
}
