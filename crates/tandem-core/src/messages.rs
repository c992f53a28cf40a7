//! Wire messages exchanged between counterparties
//!
//! A protocol instance is a short exchange of `ClientActionMessage`s sharing
//! one `request_id`. `seq` counts the position in that exchange: the
//! initiator sends the even positions, the responder the odd ones.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::app::AppState;
use crate::errors::TandemError;
use crate::identifiers::{Address, AppId, RequestId, Signature};

/// Protocol kinds understood by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolName {
    /// Open a channel between two parties
    Setup,
    /// Instantiate an app channel
    Install,
    /// Replace an app channel's state
    Update,
    /// Remove an app channel and settle its balances
    Uninstall,
}

impl ProtocolName {
    /// All protocol kinds, in lifecycle order
    pub const ALL: [ProtocolName; 4] = [
        ProtocolName::Setup,
        ProtocolName::Install,
        ProtocolName::Update,
        ProtocolName::Uninstall,
    ];

    /// Wire name of the protocol
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolName::Setup => "setup",
            ProtocolName::Install => "install",
            ProtocolName::Update => "update",
            ProtocolName::Uninstall => "uninstall",
        }
    }
}

impl fmt::Display for ProtocolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of an install request
///
/// `peer_a_balance` is what the initiator moves from its free balance into
/// the app, `peer_b_balance` what the counterparty moves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallParams {
    /// Application name, part of the derived app id
    pub app_name: String,
    /// Initiator's deposit into the app
    pub peer_a_balance: u64,
    /// Counterparty's deposit into the app
    pub peer_b_balance: u64,
    /// Initial application state
    pub state: AppState,
}

/// Parameters of an update request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateParams {
    /// Replacement application state
    pub state: AppState,
}

/// Parameters of an uninstall request
///
/// Amounts are in the initiator's orientation: `peer_a_balance` is credited
/// to the initiator, `peer_b_balance` to the counterparty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UninstallParams {
    /// Amount credited to the initiator
    pub peer_a_balance: u64,
    /// Amount credited to the counterparty
    pub peer_b_balance: u64,
}

/// Protocol-specific payload, tagged by protocol name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocolName", content = "params", rename_all = "lowercase")]
pub enum ProtocolPayload {
    /// Channel setup carries no parameters
    Setup,
    /// App installation
    Install(InstallParams),
    /// App state update
    Update(UpdateParams),
    /// App removal and settlement
    Uninstall(UninstallParams),
}

impl ProtocolPayload {
    /// Protocol this payload belongs to
    pub fn protocol_name(&self) -> ProtocolName {
        match self {
            ProtocolPayload::Setup => ProtocolName::Setup,
            ProtocolPayload::Install(_) => ProtocolName::Install,
            ProtocolPayload::Update(_) => ProtocolName::Update,
            ProtocolPayload::Uninstall(_) => ProtocolName::Uninstall,
        }
    }
}

/// Message exchanged between the two peers of a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientActionMessage {
    /// Recipient of this message
    pub to_address: Address,
    /// Sender of this message
    pub from_address: Address,
    /// Channel the protocol runs on
    pub multisig_address: Address,
    /// Target app channel, absent for setup and install
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<AppId>,
    /// Identifier shared by every message of one protocol instance
    pub request_id: RequestId,
    /// Position in the exchange
    pub seq: u32,
    /// Protocol-specific parameters
    pub payload: ProtocolPayload,
    /// Sender's signature over the staged transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
}

impl ClientActionMessage {
    /// Build the initiating (seq 0) message of a protocol instance
    pub fn initiate(
        from: Address,
        to: Address,
        multisig: Address,
        app_id: Option<AppId>,
        request_id: RequestId,
        payload: ProtocolPayload,
    ) -> Self {
        Self {
            to_address: to,
            from_address: from,
            multisig_address: multisig,
            app_id,
            request_id,
            seq: 0,
            payload,
            signature: None,
        }
    }

    /// Protocol this message belongs to
    pub fn protocol_name(&self) -> ProtocolName {
        self.payload.protocol_name()
    }

    /// Whether the initiator of the exchange sent this message
    pub fn is_from_initiator(&self) -> bool {
        self.seq % 2 == 0
    }

    /// `(to, from)` in the initiator's orientation
    pub fn initiating_parties(&self) -> (&Address, &Address) {
        if self.is_from_initiator() {
            (&self.to_address, &self.from_address)
        } else {
            (&self.from_address, &self.to_address)
        }
    }

    /// Build the responder's reply at the next position of the exchange
    pub fn reply(&self, signature: Signature) -> Self {
        Self {
            to_address: self.from_address.clone(),
            from_address: self.to_address.clone(),
            multisig_address: self.multisig_address.clone(),
            app_id: self.app_id.clone(),
            request_id: self.request_id.clone(),
            seq: self.seq + 1,
            payload: self.payload.clone(),
            signature: Some(signature),
        }
    }

    /// Check structural validity of the addressing fields
    pub fn validate(&self) -> Result<(), TandemError> {
        self.to_address.validate()?;
        self.from_address.validate()?;
        self.multisig_address.validate()?;
        if self.to_address == self.from_address {
            return Err(TandemError::invalid(
                "a channel needs two distinct counterparties",
            ));
        }
        if let Some(app_id) = &self.app_id {
            if app_id.as_str().contains('/') {
                return Err(TandemError::invalid(format!(
                    "app id {app_id} contains the log key separator"
                )));
            }
        }
        let needs_app = matches!(
            self.payload,
            ProtocolPayload::Update(_) | ProtocolPayload::Uninstall(_)
        );
        if needs_app && self.app_id.is_none() {
            return Err(TandemError::invalid(format!(
                "{} requires an app id",
                self.protocol_name()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn install_message() -> ClientActionMessage {
        ClientActionMessage::initiate(
            Address::new("0xaaa"),
            Address::new("0xbbb"),
            Address::new("0xmultisig"),
            None,
            RequestId::new("req-1"),
            ProtocolPayload::Install(InstallParams {
                app_name: "paymentApp".to_string(),
                peer_a_balance: 0,
                peer_b_balance: 0,
                state: AppState::new(json!({"aliceBalance": "10"})),
            }),
        )
    }

    #[test]
    fn test_payload_is_tagged_by_protocol_name() {
        let json = serde_json::to_value(install_message()).unwrap();
        assert_eq!(json["payload"]["protocolName"], "install");
        assert_eq!(json["payload"]["params"]["appName"], "paymentApp");
        assert_eq!(json["toAddress"], "0xbbb");
        assert!(json.get("appId").is_none());

        let setup = serde_json::to_value(ProtocolPayload::Setup).unwrap();
        assert_eq!(setup, json!({"protocolName": "setup"}));
        let decoded: ProtocolPayload = serde_json::from_value(setup).unwrap();
        assert_eq!(decoded, ProtocolPayload::Setup);
    }

    #[test]
    fn test_reply_keeps_initiating_orientation() {
        let message = install_message();
        let reply = message.reply(Signature::from_bytes(vec![7]));

        assert_eq!(reply.seq, 1);
        assert_eq!(reply.to_address, message.from_address);
        assert_eq!(message.initiating_parties(), reply.initiating_parties());
    }

    #[test]
    fn test_validate_requires_app_id_for_update() {
        let mut message = install_message();
        message.payload = ProtocolPayload::Update(UpdateParams {
            state: AppState::new(json!({})),
        });
        assert!(message.validate().is_err());

        message.app_id = Some(AppId::new("0xapp"));
        assert!(message.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_self_channel() {
        let mut message = install_message();
        message.to_address = message.from_address.clone();
        assert!(message.validate().is_err());
    }
}
