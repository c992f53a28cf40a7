//! Channel state errors

use tandem_core::{Address, AppId, ProtocolName, StorageError, TandemError};

/// Errors raised while staging or committing channel state
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    /// No channel exists at this multisig address
    #[error("channel {multisig} does not exist")]
    UnknownChannel {
        /// Multisig address that was looked up
        multisig: Address,
    },

    /// A channel already exists at this multisig address
    #[error("channel {multisig} already exists")]
    ChannelExists {
        /// Multisig address of the existing channel
        multisig: Address,
    },

    /// Address is not one of the channel's two participants
    #[error("{address} is not a participant of channel {multisig}")]
    NotAParticipant {
        /// Offending address
        address: Address,
        /// Channel that was addressed
        multisig: Address,
    },

    /// App channel is not installed
    #[error("app {app_id} is not installed")]
    UnknownApp {
        /// App id that was looked up
        app_id: AppId,
    },

    /// App channel is already installed
    #[error("app {app_id} is already installed")]
    AppExists {
        /// App id of the existing app channel
        app_id: AppId,
    },

    /// App peers are not in the channel's alice/bob order
    #[error("peers of app {app_id} are not in channel order")]
    PeerOrder {
        /// App with misordered peers
        app_id: AppId,
    },

    /// Request targets an app but carries no app id
    #[error("{0} requires an app id")]
    MissingAppId(ProtocolName),

    /// Local nonce does not match what the transition expects
    #[error("nonce mismatch on app {app_id}: expected {expected}, found {found}")]
    NonceMismatch {
        /// App whose nonce disagreed
        app_id: AppId,
        /// Nonce the transition was staged against
        expected: u64,
        /// Nonce held by the store
        found: u64,
    },

    /// Dependency nonce did not advance by exactly one
    #[error("dependency nonce must advance from {before} to {}, found {found}", before + 1)]
    DependencyNonceMismatch {
        /// Channel dependency nonce before the commit
        before: u64,
        /// Channel dependency nonce after the commit
        found: u64,
    },

    /// Free balance cannot cover a deposit
    #[error("insufficient free balance for {address}: need {needed}, have {available}")]
    InsufficientFreeBalance {
        /// Participant whose balance is short
        address: Address,
        /// Amount required
        needed: u64,
        /// Amount available
        available: u64,
    },

    /// Balance arithmetic overflowed
    #[error("balance overflow on channel {multisig}")]
    BalanceOverflow {
        /// Channel being updated
        multisig: Address,
    },

    /// Stored hash is not the hash of the stored encoding
    #[error("state hash does not match encoded state of app {app_id}")]
    StateHashMismatch {
        /// App with the inconsistent state
        app_id: AppId,
    },

    /// Total channel value changed by something other than the declared transfer
    #[error("value not conserved on channel {multisig}: expected {expected}, found {found}")]
    ConservationViolated {
        /// Channel being updated
        multisig: Address,
        /// Expected total after the commit
        expected: i128,
        /// Actual total after the commit
        found: i128,
    },

    /// App state could not be decoded or hashed
    #[error("invalid app state: {0}")]
    InvalidAppState(String),

    /// Underlying store failed
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A persisted channel record could not be decoded
    #[error("corrupt channel record {key}: {reason}")]
    Corrupt {
        /// Store key of the record
        key: String,
        /// Decode failure
        reason: String,
    },

    /// A channel record could not be encoded
    #[error("failed to encode channel state: {0}")]
    Encode(String),
}

impl StateError {
    /// Whether this error is a rejected transition rather than an I/O fault
    ///
    /// Invariant violations abort the protocol; storage faults leave it in
    /// flight so it can be retried.
    pub fn is_invariant_violation(&self) -> bool {
        !matches!(
            self,
            StateError::Storage(_) | StateError::Corrupt { .. } | StateError::Encode(_)
        )
    }
}

impl From<StateError> for TandemError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::UnknownChannel { .. } | StateError::UnknownApp { .. } => {
                TandemError::not_found(err.to_string())
            }
            StateError::Storage(_) => TandemError::storage(err.to_string()),
            StateError::Corrupt { .. } | StateError::Encode(_) => {
                TandemError::serialization(err.to_string())
            }
            _ => TandemError::invalid(err.to_string()),
        }
    }
}
