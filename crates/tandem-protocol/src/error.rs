//! Protocol engine errors

use tandem_core::{ProtocolName, RequestId, TandemError};
use tandem_state::StateError;

use crate::action::Side;
use crate::wal::WalError;

/// Errors surfaced by the protocol engine
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    /// The write-ahead log failed
    #[error("write-ahead log: {0}")]
    Wal(#[from] WalError),

    /// Staging or committing channel state failed
    #[error("channel state: {0}")]
    State(#[from] StateError),

    /// A different protocol instance already holds this log key
    #[error("log key {key} is held by request {in_flight}, rejecting request {incoming}")]
    KeyCollision {
        /// Contended log key
        key: String,
        /// Request id of the in-flight cursor
        in_flight: RequestId,
        /// Request id of the rejected message
        incoming: RequestId,
    },

    /// Message matches an in-flight cursor but not its next step
    #[error("message does not resume {key}: {reason}")]
    ResumptionMismatch {
        /// Log key of the in-flight cursor
        key: String,
        /// What did not match
        reason: String,
    },

    /// Message matches no in-flight cursor and starts nothing
    #[error("unrecognized message for {key}")]
    Unrecognized {
        /// Log key derived from the message
        key: String,
    },

    /// A step could not run on the cursor it was given
    #[error("step {step} failed: {reason}")]
    InvalidStep {
        /// Step name
        step: String,
        /// Failure description
        reason: String,
    },

    /// No pipeline is registered for this protocol and side
    #[error("no pipeline registered for {protocol} ({side})")]
    UnknownPipeline {
        /// Protocol kind
        protocol: ProtocolName,
        /// Initiator or responder
        side: Side,
    },

    /// Handing a message to the transport failed
    #[error("transport: {0}")]
    Transport(String),

    /// A signature did not verify or could not be produced
    #[error("signature: {0}")]
    Signature(String),

    /// The request itself is malformed
    #[error("invalid request: {0}")]
    Invalid(String),

    /// The engine dropped a completion before resolving it
    #[error("request {0} was abandoned before completion")]
    Abandoned(RequestId),

    /// The in-flight cursor was aborted locally
    #[error("execution under {key} was cancelled")]
    Cancelled {
        /// Log key of the aborted cursor
        key: String,
    },
}

impl ProtocolError {
    /// Construct an invalid-step error
    pub fn invalid_step(step: &str, reason: impl Into<String>) -> Self {
        Self::InvalidStep {
            step: step.to_string(),
            reason: reason.into(),
        }
    }

    /// Construct a resumption mismatch
    pub fn mismatch(key: impl ToString, reason: impl Into<String>) -> Self {
        Self::ResumptionMismatch {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the cursor must be left exactly as it was
    ///
    /// Rejected messages and storage faults keep the cursor in flight; every
    /// other step failure aborts it.
    pub fn preserves_cursor(&self) -> bool {
        match self {
            ProtocolError::ResumptionMismatch { .. }
            | ProtocolError::KeyCollision { .. }
            | ProtocolError::Unrecognized { .. }
            | ProtocolError::Wal(_)
            | ProtocolError::Transport(_) => true,
            ProtocolError::State(e) => !e.is_invariant_violation(),
            _ => false,
        }
    }
}

impl From<ProtocolError> for TandemError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::State(e) => e.into(),
            ProtocolError::Wal(WalError::Storage(_)) => TandemError::storage(err.to_string()),
            ProtocolError::Wal(_) => TandemError::serialization(err.to_string()),
            ProtocolError::Transport(_) => TandemError::network(err.to_string()),
            ProtocolError::Signature(_) => TandemError::crypto(err.to_string()),
            ProtocolError::Invalid(_) => TandemError::invalid(err.to_string()),
            _ => TandemError::protocol(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::{Address, StorageError};

    #[test]
    fn test_preserves_cursor() {
        assert!(ProtocolError::mismatch("k", "wrong seq").preserves_cursor());
        assert!(ProtocolError::Wal(WalError::Storage(StorageError::WriteFailed(
            "disk".to_string()
        )))
        .preserves_cursor());
        assert!(!ProtocolError::Signature("bad".to_string()).preserves_cursor());
        assert!(!ProtocolError::Cancelled {
            key: "k".to_string()
        }
        .preserves_cursor());
        assert!(!ProtocolError::State(StateError::UnknownChannel {
            multisig: Address::new("0xmultisig"),
        })
        .preserves_cursor());
    }

    #[test]
    fn test_into_tandem_error() {
        let err: TandemError = ProtocolError::Transport("closed".to_string()).into();
        assert!(matches!(err, TandemError::Network { .. }));
    }
}
