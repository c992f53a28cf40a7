//! Filesystem storage handler
//!
//! Each key is a file `{base}/{key}.dat`; `/` inside a key becomes a
//! directory level. A write lands in a temporary sibling, is fsynced, renamed
//! over the target and the directory is fsynced, so `store` returns only once
//! the new value survives a crash.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tandem_core::effects::{StorageEffects, StorageError};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const DATA_EXTENSION: &str = "dat";
const TEMP_EXTENSION: &str = "tmp";

/// Filesystem-based durable storage handler
///
/// Writers inside one process are serialized, which makes
/// `compare_and_swap` atomic for every engine sharing this handler. Engines
/// in different processes must not share a base directory.
#[derive(Debug)]
pub struct FilesystemStorageHandler {
    base_path: PathBuf,
    write_lock: Mutex<()>,
}

impl FilesystemStorageHandler {
    /// Create a new filesystem storage handler rooted at `base_path`
    pub fn new(base_path: PathBuf) -> Self {
        Self {
            base_path,
            write_lock: Mutex::new(()),
        }
    }

    /// Root directory of this store
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey {
                reason: "Key cannot be empty".to_string(),
            });
        }
        if key.starts_with('/') || key.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(StorageError::InvalidKey {
                reason: format!("Key {key} is not a relative path"),
            });
        }
        Ok(self.base_path.join(format!("{key}.{DATA_EXTENSION}")))
    }

    async fn read_path(path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::ReadFailed(format!(
                "Failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn write_durable(path: &Path, value: &[u8]) -> Result<(), StorageError> {
        let parent = path.parent().ok_or_else(|| {
            StorageError::WriteFailed(format!("{} has no parent directory", path.display()))
        })?;
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::WriteFailed(format!("Failed to create directory: {e}")))?;

        let temp_path = path.with_extension(TEMP_EXTENSION);
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StorageError::WriteFailed(format!("Failed to create file: {e}")))?;
        file.write_all(value)
            .await
            .map_err(|e| StorageError::WriteFailed(format!("Failed to write file: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::WriteFailed(format!("Failed to sync file: {e}")))?;
        drop(file);

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| StorageError::WriteFailed(format!("Failed to rename file: {e}")))?;
        Self::sync_dir(parent).await;
        Ok(())
    }

    async fn remove_path(path: &Path) -> Result<bool, StorageError> {
        match fs::remove_file(path).await {
            Ok(()) => {
                if let Some(parent) = path.parent() {
                    Self::sync_dir(parent).await;
                }
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::DeleteFailed(format!(
                "Failed to remove {}: {e}",
                path.display()
            ))),
        }
    }

    async fn sync_dir(dir: &Path) {
        // Directory fsync is not supported everywhere; the rename itself is
        // still atomic.
        match fs::File::open(dir).await {
            Ok(handle) => {
                if let Err(e) = handle.sync_all().await {
                    tracing::debug!(dir = %dir.display(), error = %e, "directory sync skipped");
                }
            }
            Err(e) => {
                tracing::debug!(dir = %dir.display(), error = %e, "directory open for sync failed");
            }
        }
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.base_path).ok()?;
        let without_ext = relative.with_extension("");
        let parts: Vec<&str> = without_ext
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        Some(parts.join("/"))
    }
}

#[async_trait]
impl StorageEffects for FilesystemStorageHandler {
    async fn store(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let _guard = self.write_lock.lock().await;
        Self::write_durable(&path, &value).await
    }

    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path_for(key)?;
        Self::read_path(&path).await
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        let _guard = self.write_lock.lock().await;
        Self::remove_path(&path).await
    }

    async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StorageError> {
        // Keys may contain separators, so walk the tree.
        let mut keys = Vec::new();
        let mut stack = vec![self.base_path.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(StorageError::ReadFailed(format!(
                        "Failed to read directory: {e}"
                    )))
                }
            };

            while let Some(entry) = entries.next_entry().await.map_err(|e| {
                StorageError::ReadFailed(format!("Failed to read directory entry: {e}"))
            })? {
                let file_type = entry.file_type().await.map_err(|e| {
                    StorageError::ReadFailed(format!("Failed to stat directory entry: {e}"))
                })?;
                let path = entry.path();
                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) != Some(DATA_EXTENSION) {
                    continue;
                }
                if let Some(key) = self.key_for(&path) {
                    if prefix.map_or(true, |p| key.starts_with(p)) {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        let _guard = self.write_lock.lock().await;

        let current = Self::read_path(&path).await?;
        if current.as_deref() != expected {
            return Ok(false);
        }
        match new {
            Some(value) => Self::write_durable(&path, &value).await?,
            None => {
                Self::remove_path(&path).await?;
            }
        }
        Ok(true)
    }
}
