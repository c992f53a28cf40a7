//! Transport to the counterparty
//!
//! Only the outbound half lives here. Inbound delivery is whoever holds the
//! engine calling `ProtocolEngine::receive`.

use async_trait::async_trait;

use crate::errors::TandemError;
use crate::messages::ClientActionMessage;

/// Outbound message delivery
#[async_trait]
pub trait TransportEffects: Send + Sync {
    /// Hand `message` to the transport for delivery to `message.to_address`
    async fn send(&self, message: ClientActionMessage) -> Result<(), TandemError>;
}
