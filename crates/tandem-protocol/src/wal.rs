//! Write-ahead log of in-flight execution cursors
//!
//! Every in-flight cursor has exactly one entry, addressed by its log key and
//! replaced on each write. Two layouts:
//!
//! - `Document`: the whole log is one JSON object under the namespace key,
//!   read-modify-written on every write/clear. One engine per store.
//! - `PerRecord`: each entry is its own key under `{namespace}/`, written with
//!   compare-and-swap against the value this log last observed, so engines
//!   sharing a store detect each other instead of overwriting.
//!
//! A record that fails to decode or validate is fatal: resuming around a
//! missing record could diverge from the counterparty.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tandem_core::{
    Address, ClientActionMessage, Digest, ProtocolName, RequestId, StorageEffects, StorageError,
    WalConfig, WalLayout,
};
use tracing::{debug, error, instrument};

use crate::action::{Action, ExecutionCursor, LogKey};
use crate::middleware::StepResult;

/// Write-ahead log errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalError {
    /// The store failed; the log is unchanged
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A record could not be encoded
    #[error("failed to encode log: {0}")]
    Encode(String),

    /// A persisted record could not be decoded or is inconsistent
    #[error("corrupt log entry {key}: {reason}")]
    Corrupt {
        /// Log key or store key of the entry
        key: String,
        /// What was wrong with it
        reason: String,
    },

    /// Another writer changed the entry since this log last saw it
    #[error("log entry {key} was changed by another writer")]
    Conflict {
        /// Store key of the entry
        key: String,
    },
}

/// Persisted form of an execution cursor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    /// Protocol being run
    pub protocol_name: ProtocolName,
    /// Responder, in the initiator's orientation
    pub to: Address,
    /// Initiator
    pub from: Address,
    /// Protocol instance
    pub request_id: RequestId,
    /// Initiating message
    pub client_message: ClientActionMessage,
    /// Whether the local engine is the responder
    pub is_ack_side: bool,
    /// Next step to run
    pub instruction_pointer: usize,
    /// Results of completed steps
    pub results: Vec<StepResult>,
}

impl LogRecord {
    /// Record for a cursor
    pub fn from_cursor(cursor: &ExecutionCursor) -> Self {
        let message = &cursor.action.client_message;
        let (to, from) = message.initiating_parties();
        Self {
            protocol_name: cursor.action.protocol_name,
            to: to.clone(),
            from: from.clone(),
            request_id: cursor.action.request_id.clone(),
            client_message: message.clone(),
            is_ack_side: cursor.action.is_ack_side,
            instruction_pointer: cursor.instruction_pointer,
            results: cursor.results.clone(),
        }
    }

    /// Rebuild the cursor, checking the record against the key it was filed under
    pub fn into_cursor(self, key: &str) -> Result<ExecutionCursor, WalError> {
        let corrupt = |reason: String| WalError::Corrupt {
            key: key.to_string(),
            reason,
        };

        if self.protocol_name != self.client_message.protocol_name() {
            return Err(corrupt(format!(
                "protocol {} does not match payload {}",
                self.protocol_name,
                self.client_message.protocol_name()
            )));
        }
        if self.request_id != self.client_message.request_id {
            return Err(corrupt("request id does not match message".to_string()));
        }
        let derived = LogKey::for_message(&self.client_message);
        if derived.as_str() != key {
            return Err(corrupt(format!("record belongs under {derived}")));
        }
        let (to, from) = self.client_message.initiating_parties();
        if *to != self.to || *from != self.from {
            return Err(corrupt("addresses do not match message".to_string()));
        }
        if self.instruction_pointer != self.results.len() {
            return Err(corrupt(format!(
                "instruction pointer {} with {} results",
                self.instruction_pointer,
                self.results.len()
            )));
        }

        Ok(ExecutionCursor {
            action: Action::new(self.client_message, self.is_ack_side),
            instruction_pointer: self.instruction_pointer,
            results: self.results,
        })
    }
}

type LogDocument = BTreeMap<String, LogRecord>;

/// Durable record of in-flight cursors
pub struct WriteAheadLog {
    storage: Arc<dyn StorageEffects>,
    config: WalConfig,
    guard: tokio::sync::Mutex<()>,
    observed: Mutex<HashMap<String, Vec<u8>>>,
}

impl std::fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAheadLog")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WriteAheadLog {
    /// Create a log over `storage`
    pub fn new(storage: Arc<dyn StorageEffects>, config: WalConfig) -> Self {
        Self {
            storage,
            config,
            guard: tokio::sync::Mutex::new(()),
            observed: Mutex::new(HashMap::new()),
        }
    }

    /// Layout in use
    pub fn layout(&self) -> WalLayout {
        self.config.layout
    }

    fn record_key(&self, key: &LogKey) -> String {
        format!(
            "{}/{}",
            self.config.namespace,
            Digest::of(key.as_str().as_bytes())
        )
    }

    /// Insert or replace the entry for the cursor's log key
    ///
    /// Returns once the store holds the new entry.
    #[instrument(skip(self, cursor), fields(key = %cursor.log_key(), ip = cursor.instruction_pointer))]
    pub async fn write(&self, cursor: &ExecutionCursor) -> Result<(), WalError> {
        let key = cursor.log_key();
        let record = LogRecord::from_cursor(cursor);
        let _guard = self.guard.lock().await;

        match self.config.layout {
            WalLayout::Document => {
                let mut document = self.load_document().await?;
                document.insert(key.to_string(), record);
                self.store_document(&document).await
            }
            WalLayout::PerRecord => {
                let bytes =
                    serde_json::to_vec(&record).map_err(|e| WalError::Encode(e.to_string()))?;
                self.swap_record(&key, Some(bytes)).await
            }
        }
    }

    /// Remove the entry for the cursor's log key
    #[instrument(skip(self, cursor), fields(key = %cursor.log_key()))]
    pub async fn clear(&self, cursor: &ExecutionCursor) -> Result<(), WalError> {
        let key = cursor.log_key();
        let _guard = self.guard.lock().await;

        match self.config.layout {
            WalLayout::Document => {
                let mut document = self.load_document().await?;
                if document.remove(key.as_str()).is_none() {
                    return Ok(());
                }
                self.store_document(&document).await
            }
            WalLayout::PerRecord => self.swap_record(&key, None).await,
        }
    }

    /// Every in-flight cursor, as last written
    #[instrument(skip(self))]
    pub async fn read(&self) -> Result<Vec<ExecutionCursor>, WalError> {
        let _guard = self.guard.lock().await;

        let result = match self.config.layout {
            WalLayout::Document => self.read_document().await,
            WalLayout::PerRecord => self.read_records().await,
        };
        if let Err(e) = &result {
            error!(error = %e, "write-ahead log unreadable");
        }
        result
    }

    async fn load_document(&self) -> Result<LogDocument, WalError> {
        match self.storage.retrieve(&self.config.namespace).await? {
            None => Ok(LogDocument::new()),
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| WalError::Corrupt {
                key: self.config.namespace.clone(),
                reason: e.to_string(),
            }),
        }
    }

    async fn store_document(&self, document: &LogDocument) -> Result<(), WalError> {
        let bytes = serde_json::to_vec(document).map_err(|e| WalError::Encode(e.to_string()))?;
        self.storage.store(&self.config.namespace, bytes).await?;
        Ok(())
    }

    async fn read_document(&self) -> Result<Vec<ExecutionCursor>, WalError> {
        let document = self.load_document().await?;
        let cursors = document
            .into_iter()
            .map(|(key, record)| record.into_cursor(&key))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(entries = cursors.len(), "read write-ahead log");
        Ok(cursors)
    }

    async fn read_records(&self) -> Result<Vec<ExecutionCursor>, WalError> {
        let prefix = format!("{}/", self.config.namespace);
        let keys = self.storage.list_keys(Some(&prefix)).await?;

        let mut cursors = Vec::with_capacity(keys.len());
        let mut observed = HashMap::with_capacity(keys.len());
        for store_key in keys {
            let Some(bytes) = self.storage.retrieve(&store_key).await? else {
                continue;
            };
            let record: LogRecord =
                serde_json::from_slice(&bytes).map_err(|e| WalError::Corrupt {
                    key: store_key.clone(),
                    reason: e.to_string(),
                })?;
            let log_key = LogKey::for_message(&record.client_message);
            if self.record_key(&log_key) != store_key {
                return Err(WalError::Corrupt {
                    key: store_key,
                    reason: format!("record belongs under {log_key}"),
                });
            }
            cursors.push(record.into_cursor(log_key.as_str())?);
            observed.insert(store_key, bytes);
        }

        *self.observed.lock() = observed;
        debug!(entries = cursors.len(), "read write-ahead log records");
        Ok(cursors)
    }

    async fn swap_record(&self, key: &LogKey, new: Option<Vec<u8>>) -> Result<(), WalError> {
        let store_key = self.record_key(key);
        let expected = self.observed.lock().get(&store_key).cloned();

        let swapped = self
            .storage
            .compare_and_swap(&store_key, expected.as_deref(), new.clone())
            .await?;
        if !swapped {
            return Err(WalError::Conflict { key: store_key });
        }

        let mut observed = self.observed.lock();
        match new {
            Some(bytes) => {
                observed.insert(store_key, bytes);
            }
            None => {
                observed.remove(&store_key);
            }
        }
        Ok(())
    }
}
