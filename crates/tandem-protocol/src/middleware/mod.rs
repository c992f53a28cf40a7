//! Pipeline steps
//!
//! A step is a pure function of the cursor's accumulated results, the
//! channel snapshot the cursor was dispatched against and, for steps that
//! wait on the counterparty, the inbound message. It returns a
//! `StepResult` for the engine to journal, or asks the engine to suspend the
//! cursor until the awaited message arrives. Steps never mutate channel
//! state; they only stage a transition for the engine to commit.

use serde::{Deserialize, Serialize};
use tandem_core::{Address, ClientActionMessage, Digest, SigningEffects, Signature};
use tandem_state::{ChannelState, StagedTransition};

use crate::action::Action;
use crate::error::ProtocolError;

mod steps;

pub use steps::{
    AwaitCounterSignature, ComputeCommitment, SendCounterSignature, SendProposal,
    SignCommitment, StageTransition, VerifyCounterSignature, VerifyProposerSignature,
};

/// Output of one completed step, journaled with the cursor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum StepResult {
    /// Transition to commit once the pipeline completes
    Staged {
        /// The staged transition
        transition: StagedTransition,
    },
    /// Digest both peers sign
    Commitment {
        /// Digest of the staged transition
        digest: Digest,
    },
    /// Local signature over the commitment
    Signed {
        /// Signature by the local participant
        signature: Signature,
    },
    /// Message handed to the transport after this result was journaled
    Sent {
        /// Outgoing message
        message: ClientActionMessage,
    },
    /// Counterparty signature taken from its reply
    PeerSigned {
        /// Signature by the counterparty
        signature: Signature,
    },
    /// A counterparty signature checked out
    Verified {
        /// Address whose signature was verified
        signer: Address,
    },
}

impl StepResult {
    /// Message to send once this result is durable
    pub fn outgoing(&self) -> Option<&ClientActionMessage> {
        match self {
            StepResult::Sent { message } => Some(message),
            _ => None,
        }
    }
}

/// What a step asks the engine to do next
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Record the result and run the next step
    Continue(StepResult),
    /// Park the cursor until the awaited message arrives
    Suspend,
}

/// Inputs available to a step
pub struct StepContext<'a> {
    /// Action being executed
    pub action: &'a Action,
    /// Results of the steps already completed
    pub results: &'a [StepResult],
    /// Channel state the cursor was dispatched against
    pub snapshot: Option<&'a ChannelState>,
    /// Counterparty message, only for steps that await one
    pub inbound: Option<&'a ClientActionMessage>,
    /// Local participant
    pub me: &'a Address,
    /// Local key custody
    pub signer: &'a dyn SigningEffects,
}

impl<'a> StepContext<'a> {
    /// Staged transition, required by every step after the first
    pub fn staged(&self, step: &str) -> Result<&'a StagedTransition, ProtocolError> {
        self.results
            .iter()
            .find_map(|result| match result {
                StepResult::Staged { transition } => Some(transition),
                _ => None,
            })
            .ok_or_else(|| ProtocolError::invalid_step(step, "no staged transition"))
    }

    /// Commitment computed over the staged transition
    pub fn commitment(&self, step: &str) -> Result<&'a Digest, ProtocolError> {
        self.results
            .iter()
            .find_map(|result| match result {
                StepResult::Commitment { digest } => Some(digest),
                _ => None,
            })
            .ok_or_else(|| ProtocolError::invalid_step(step, "no commitment"))
    }

    /// Local signature over the commitment
    pub fn own_signature(&self, step: &str) -> Result<&'a Signature, ProtocolError> {
        self.results
            .iter()
            .find_map(|result| match result {
                StepResult::Signed { signature } => Some(signature),
                _ => None,
            })
            .ok_or_else(|| ProtocolError::invalid_step(step, "commitment not signed"))
    }

    /// Counterparty signature received in its reply
    pub fn peer_signature(&self, step: &str) -> Result<&'a Signature, ProtocolError> {
        self.results
            .iter()
            .find_map(|result| match result {
                StepResult::PeerSigned { signature } => Some(signature),
                _ => None,
            })
            .ok_or_else(|| ProtocolError::invalid_step(step, "no counter-signature"))
    }
}

/// One unit of protocol logic within a pipeline
pub trait Step: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &'static str;

    /// Sequence number of the counterparty message this step waits for
    fn awaits(&self) -> Option<u32> {
        None
    }

    /// Run the step
    fn run(&self, context: &StepContext<'_>) -> Result<StepOutcome, ProtocolError>;
}
