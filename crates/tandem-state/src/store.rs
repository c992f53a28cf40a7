//! Channel State Store
//!
//! Holds every channel this participant is part of, persisted one record per
//! channel under `{namespace}/{multisig}`. Reads are served from an in-memory
//! copy; `commit` is the only writer. A commit validates the transition,
//! persists the new record and only then swaps the in-memory copy, so a
//! failed commit leaves no partial change behind.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tandem_core::{Address, AppId, StateConfig, StorageEffects};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::channel::{ChannelState, FreeBalanceState};
use crate::error::StateError;
use crate::invariants::check_commit;
use crate::transition::StagedTransition;

/// Result of a successful commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Channel that was committed to
    pub multisig_address: Address,
    /// App the transition targeted, if any
    pub app_id: Option<AppId>,
    /// The transition was already reflected in the store and was skipped
    pub already_applied: bool,
}

/// Persistent store of channel states
pub struct ChannelStateStore {
    storage: Arc<dyn StorageEffects>,
    namespace: String,
    channels: RwLock<BTreeMap<Address, ChannelState>>,
    commit_lock: Mutex<()>,
}

impl std::fmt::Debug for ChannelStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelStateStore")
            .field("namespace", &self.namespace)
            .field("channels", &self.channels.read().len())
            .finish_non_exhaustive()
    }
}

impl ChannelStateStore {
    /// Create an empty store; call `load` to pick up persisted channels
    pub fn new(storage: Arc<dyn StorageEffects>, config: &StateConfig) -> Self {
        Self {
            storage,
            namespace: config.namespace.clone(),
            channels: RwLock::new(BTreeMap::new()),
            commit_lock: Mutex::new(()),
        }
    }

    /// Create a store and load every persisted channel
    pub async fn open(
        storage: Arc<dyn StorageEffects>,
        config: &StateConfig,
    ) -> Result<Self, StateError> {
        let store = Self::new(storage, config);
        store.load().await?;
        Ok(store)
    }

    fn key_for(&self, multisig: &Address) -> String {
        format!("{}/{}", self.namespace, multisig)
    }

    /// Reload every persisted channel into memory
    ///
    /// A record that fails to decode is fatal: the store refuses to run on
    /// top of state it cannot read.
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn load(&self) -> Result<usize, StateError> {
        let prefix = format!("{}/", self.namespace);
        let keys = self.storage.list_keys(Some(&prefix)).await?;

        let mut loaded = BTreeMap::new();
        for key in keys {
            let Some(bytes) = self.storage.retrieve(&key).await? else {
                continue;
            };
            let channel: ChannelState =
                serde_json::from_slice(&bytes).map_err(|e| StateError::Corrupt {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
            if key != self.key_for(&channel.multisig_address) {
                return Err(StateError::Corrupt {
                    key,
                    reason: format!("record names channel {}", channel.multisig_address),
                });
            }
            loaded.insert(channel.multisig_address.clone(), channel);
        }

        let count = loaded.len();
        *self.channels.write() = loaded;
        debug!(channels = count, "loaded channel states");
        Ok(count)
    }

    /// Snapshot of one channel, if it exists
    pub fn snapshot(&self, multisig: &Address) -> Option<ChannelState> {
        self.channels.read().get(multisig).cloned()
    }

    /// Full state of one channel
    pub fn query_state_channel(&self, multisig: &Address) -> Result<ChannelState, StateError> {
        self.snapshot(multisig)
            .ok_or_else(|| StateError::UnknownChannel {
                multisig: multisig.clone(),
            })
    }

    /// Free balance of one channel
    pub fn query_free_balance(&self, multisig: &Address) -> Result<FreeBalanceState, StateError> {
        self.channels
            .read()
            .get(multisig)
            .map(|channel| channel.free_balance.clone())
            .ok_or_else(|| StateError::UnknownChannel {
                multisig: multisig.clone(),
            })
    }

    /// Multisig addresses of every known channel
    pub fn channels(&self) -> Vec<Address> {
        self.channels.read().keys().cloned().collect()
    }

    /// Apply a staged transition
    ///
    /// Idempotent per transition: if the store already reflects it, nothing is
    /// written and the receipt says so.
    #[instrument(skip(self, transition), fields(
        protocol = %transition.protocol_name(),
        multisig = %transition.multisig_address(),
    ))]
    pub async fn commit(
        &self,
        me: &Address,
        transition: &StagedTransition,
    ) -> Result<CommitReceipt, StateError> {
        let _guard = self.commit_lock.lock().await;

        let multisig = transition.multisig_address();
        let receipt = |already_applied| CommitReceipt {
            multisig_address: multisig.clone(),
            app_id: transition.app_id().cloned(),
            already_applied,
        };

        let before = self.snapshot(multisig);
        if transition.is_applied(before.as_ref()) {
            debug!("transition already applied");
            return Ok(receipt(true));
        }

        let after = transition.apply(me, before.as_ref())?;
        if let Err(e) = check_commit(before.as_ref(), &after, transition) {
            warn!(error = %e, "rejected channel transition");
            return Err(e);
        }

        let bytes = serde_json::to_vec(&after).map_err(|e| StateError::Encode(e.to_string()))?;
        self.storage.store(&self.key_for(multisig), bytes).await?;
        self.channels.write().insert(multisig.clone(), after);

        info!("committed channel transition");
        Ok(receipt(false))
    }
}
