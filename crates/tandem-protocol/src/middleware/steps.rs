//! Steps shared by the four channel protocols

use tandem_core::{Address, Digest, Signature};
use tandem_state::StagedTransition;
use tracing::debug;

use super::{Step, StepContext, StepOutcome, StepResult};
use crate::error::ProtocolError;

/// Stage the transition requested by the initiating message
#[derive(Debug, Default)]
pub struct StageTransition;

impl Step for StageTransition {
    fn name(&self) -> &'static str {
        "stage_transition"
    }

    fn run(&self, context: &StepContext<'_>) -> Result<StepOutcome, ProtocolError> {
        let transition =
            StagedTransition::propose(&context.action.client_message, context.snapshot)?;
        Ok(StepOutcome::Continue(StepResult::Staged { transition }))
    }
}

/// Hash the staged transition into the commitment both peers sign
#[derive(Debug, Default)]
pub struct ComputeCommitment;

impl Step for ComputeCommitment {
    fn name(&self) -> &'static str {
        "compute_commitment"
    }

    fn run(&self, context: &StepContext<'_>) -> Result<StepOutcome, ProtocolError> {
        let digest = context.staged(self.name())?.digest()?;
        Ok(StepOutcome::Continue(StepResult::Commitment { digest }))
    }
}

/// Sign the commitment with the local key
#[derive(Debug, Default)]
pub struct SignCommitment;

impl Step for SignCommitment {
    fn name(&self) -> &'static str {
        "sign_commitment"
    }

    fn run(&self, context: &StepContext<'_>) -> Result<StepOutcome, ProtocolError> {
        let digest = context.commitment(self.name())?;
        let signature = context
            .signer
            .sign(digest)
            .map_err(|e| ProtocolError::Signature(e.to_string()))?;
        Ok(StepOutcome::Continue(StepResult::Signed { signature }))
    }
}

/// Send the signed initiating message to the responder
#[derive(Debug, Default)]
pub struct SendProposal;

impl Step for SendProposal {
    fn name(&self) -> &'static str {
        "send_proposal"
    }

    fn run(&self, context: &StepContext<'_>) -> Result<StepOutcome, ProtocolError> {
        let mut message = context.action.client_message.clone();
        message.signature = Some(context.own_signature(self.name())?.clone());
        Ok(StepOutcome::Continue(StepResult::Sent { message }))
    }
}

/// Wait for the responder's counter-signed reply
#[derive(Debug, Default)]
pub struct AwaitCounterSignature;

impl Step for AwaitCounterSignature {
    fn name(&self) -> &'static str {
        "await_counter_signature"
    }

    fn awaits(&self) -> Option<u32> {
        Some(1)
    }

    fn run(&self, context: &StepContext<'_>) -> Result<StepOutcome, ProtocolError> {
        let Some(reply) = context.inbound else {
            debug!(request_id = %context.action.request_id, "awaiting counter-signature");
            return Ok(StepOutcome::Suspend);
        };

        let key = context.action.log_key();
        if reply.seq != 1 {
            return Err(ProtocolError::mismatch(
                key,
                format!("expected seq 1, got {}", reply.seq),
            ));
        }
        if reply.from_address != *context.action.counterparty() {
            return Err(ProtocolError::mismatch(
                key,
                format!("reply sent by {}", reply.from_address),
            ));
        }
        let signature = reply
            .signature
            .clone()
            .ok_or_else(|| ProtocolError::mismatch(key, "reply carries no signature"))?;
        Ok(StepOutcome::Continue(StepResult::PeerSigned { signature }))
    }
}

/// Check the responder's signature against our own commitment
#[derive(Debug, Default)]
pub struct VerifyCounterSignature;

impl Step for VerifyCounterSignature {
    fn name(&self) -> &'static str {
        "verify_counter_signature"
    }

    fn run(&self, context: &StepContext<'_>) -> Result<StepOutcome, ProtocolError> {
        let digest = context.commitment(self.name())?;
        let signature = context.peer_signature(self.name())?;
        let signer = context.action.counterparty();
        verify(context, signer, digest, signature)?;
        Ok(StepOutcome::Continue(StepResult::Verified {
            signer: signer.clone(),
        }))
    }
}

/// Check the initiator's signature against the independently staged commitment
///
/// A mismatch means the two peers staged different transitions, which aborts
/// the responder's run.
#[derive(Debug, Default)]
pub struct VerifyProposerSignature;

impl Step for VerifyProposerSignature {
    fn name(&self) -> &'static str {
        "verify_proposer_signature"
    }

    fn run(&self, context: &StepContext<'_>) -> Result<StepOutcome, ProtocolError> {
        let digest = context.commitment(self.name())?;
        let signature = context
            .action
            .client_message
            .signature
            .as_ref()
            .ok_or_else(|| ProtocolError::Signature("proposal is unsigned".to_string()))?;
        let signer = context.action.counterparty();
        verify(context, signer, digest, signature)?;
        Ok(StepOutcome::Continue(StepResult::Verified {
            signer: signer.clone(),
        }))
    }
}

/// Reply to the initiator with the local counter-signature
#[derive(Debug, Default)]
pub struct SendCounterSignature;

impl Step for SendCounterSignature {
    fn name(&self) -> &'static str {
        "send_counter_signature"
    }

    fn run(&self, context: &StepContext<'_>) -> Result<StepOutcome, ProtocolError> {
        let signature = context.own_signature(self.name())?.clone();
        let message = context.action.client_message.reply(signature);
        Ok(StepOutcome::Continue(StepResult::Sent { message }))
    }
}

fn verify(
    context: &StepContext<'_>,
    signer: &Address,
    digest: &Digest,
    signature: &Signature,
) -> Result<(), ProtocolError> {
    let valid = context
        .signer
        .verify(signer, digest, signature)
        .map_err(|e| ProtocolError::Signature(e.to_string()))?;
    if !valid {
        return Err(ProtocolError::Signature(format!(
            "signature by {signer} does not match the staged transition"
        )));
    }
    Ok(())
}
