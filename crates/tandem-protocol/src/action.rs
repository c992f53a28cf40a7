//! Actions, execution cursors and log keys

use serde::{Deserialize, Serialize};
use std::fmt;
use tandem_core::{Address, AppId, ClientActionMessage, ProtocolName, RequestId};
use tandem_state::StagedTransition;

use crate::middleware::StepResult;

/// Which end of an exchange an engine is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Sent the initiating message
    Initiator,
    /// Acknowledges the initiating message
    Responder,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Initiator => f.write_str("initiator"),
            Side::Responder => f.write_str("responder"),
        }
    }
}

/// Immutable descriptor of one protocol instance
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    /// Selects the pipeline
    pub protocol_name: ProtocolName,
    /// Caller-supplied instance identifier
    pub request_id: RequestId,
    /// The initiating (seq 0) message
    pub client_message: ClientActionMessage,
    /// Whether this engine is the responder
    pub is_ack_side: bool,
}

impl Action {
    /// Build the action for an initiating message
    pub fn new(client_message: ClientActionMessage, is_ack_side: bool) -> Self {
        Self {
            protocol_name: client_message.protocol_name(),
            request_id: client_message.request_id.clone(),
            client_message,
            is_ack_side,
        }
    }

    /// Side this engine runs
    pub fn side(&self) -> Side {
        if self.is_ack_side {
            Side::Responder
        } else {
            Side::Initiator
        }
    }

    /// The participant this engine exchanges messages with
    pub fn counterparty(&self) -> &Address {
        if self.is_ack_side {
            &self.client_message.from_address
        } else {
            &self.client_message.to_address
        }
    }

    /// Log key of this action
    pub fn log_key(&self) -> LogKey {
        LogKey::for_message(&self.client_message)
    }
}

/// Resumable progress of one action
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionCursor {
    /// What is being executed
    pub action: Action,
    /// Index of the next pipeline step
    pub instruction_pointer: usize,
    /// One result per completed step, in order
    pub results: Vec<StepResult>,
}

impl ExecutionCursor {
    /// Fresh cursor at the first step
    pub fn new(action: Action) -> Self {
        Self {
            action,
            instruction_pointer: 0,
            results: Vec::new(),
        }
    }

    /// Cursor after one more step completed with `result`
    pub fn advanced(&self, result: StepResult) -> Self {
        let mut results = self.results.clone();
        results.push(result);
        Self {
            action: self.action.clone(),
            instruction_pointer: self.instruction_pointer + 1,
            results,
        }
    }

    /// Transition staged by the pipeline, once staged
    pub fn staged_transition(&self) -> Option<&StagedTransition> {
        self.results.iter().find_map(|result| match result {
            StepResult::Staged { transition } => Some(transition),
            _ => None,
        })
    }

    /// Log key of the underlying action
    pub fn log_key(&self) -> LogKey {
        self.action.log_key()
    }
}

/// Write-ahead log key: `protocolName/to/from/multisigAddress/appId`
///
/// `to`/`from` are in the initiator's orientation, so both messages of an
/// exchange map to the same key. The request id is not part of the key: at
/// most one instance per protocol, direction and app can be in flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogKey(String);

impl LogKey {
    /// Compose a key from its parts; an absent app id is an empty segment
    pub fn new(
        protocol_name: ProtocolName,
        to: &Address,
        from: &Address,
        multisig: &Address,
        app_id: Option<&AppId>,
    ) -> Self {
        Self(format!(
            "{}/{}/{}/{}/{}",
            protocol_name,
            to,
            from,
            multisig,
            app_id.map(AppId::as_str).unwrap_or_default()
        ))
    }

    /// Key of the exchange a message belongs to
    pub fn for_message(message: &ClientActionMessage) -> Self {
        let (to, from) = message.initiating_parties();
        Self::new(
            message.protocol_name(),
            to,
            from,
            &message.multisig_address,
            message.app_id.as_ref(),
        )
    }

    /// Textual form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::{ProtocolPayload, Signature, UninstallParams};

    fn setup_message() -> ClientActionMessage {
        ClientActionMessage::initiate(
            Address::new("0xaaa"),
            Address::new("0xbbb"),
            Address::new("0xmultisig"),
            None,
            RequestId::new("req-1"),
            ProtocolPayload::Setup,
        )
    }

    #[test]
    fn test_log_key_format() {
        let key = LogKey::for_message(&setup_message());
        assert_eq!(key.as_str(), "setup/0xbbb/0xaaa/0xmultisig/");

        let mut uninstall = setup_message();
        uninstall.app_id = Some(AppId::new("0xapp"));
        uninstall.payload = ProtocolPayload::Uninstall(UninstallParams {
            peer_a_balance: 1,
            peer_b_balance: 2,
        });
        assert_eq!(
            LogKey::for_message(&uninstall).as_str(),
            "uninstall/0xbbb/0xaaa/0xmultisig/0xapp"
        );
    }

    #[test]
    fn test_reply_shares_log_key() {
        let message = setup_message();
        let reply = message.reply(Signature::from_bytes(vec![1]));
        assert_eq!(LogKey::for_message(&message), LogKey::for_message(&reply));
    }

    #[test]
    fn test_log_key_ignores_request_id() {
        let first = setup_message();
        let mut second = setup_message();
        second.request_id = RequestId::new("req-2");
        assert_eq!(LogKey::for_message(&first), LogKey::for_message(&second));
    }

    #[test]
    fn test_action_sides() {
        let initiator = Action::new(setup_message(), false);
        let responder = Action::new(setup_message(), true);

        assert_eq!(initiator.side(), Side::Initiator);
        assert_eq!(initiator.counterparty(), &Address::new("0xbbb"));
        assert_eq!(responder.counterparty(), &Address::new("0xaaa"));
        assert_eq!(initiator.log_key(), responder.log_key());
    }

    #[test]
    fn test_advanced_leaves_original_untouched() {
        let cursor = ExecutionCursor::new(Action::new(setup_message(), false));
        let next = cursor.advanced(StepResult::Signed {
            signature: Signature::from_bytes(vec![1]),
        });

        assert_eq!(cursor.instruction_pointer, 0);
        assert!(cursor.results.is_empty());
        assert_eq!(next.instruction_pointer, 1);
        assert_eq!(next.results.len(), 1);
    }
}
