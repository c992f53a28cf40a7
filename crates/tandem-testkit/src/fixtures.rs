//! Deterministic keys, addresses and app states

use serde_json::json;
use tandem_core::{Address, AppState, SigningEffects};
use tandem_effects::Ed25519SigningHandler;

/// Key seed of the first test participant
pub const ALICE_SEED: [u8; 32] = [0xA1; 32];

/// Key seed of the second test participant
pub const BOB_SEED: [u8; 32] = [0xB0; 32];

/// Channel address used by the scenarios
pub const MULTISIG: &str = "0x00000000000000000000000000000000000000c0";

/// Name of the payment app installed by the scenarios
pub const PAYMENT_APP: &str = "paymentApp";

/// Signer for a seed
pub fn signer(seed: [u8; 32]) -> Ed25519SigningHandler {
    Ed25519SigningHandler::from_secret_bytes(seed)
}

/// Address for a seed
pub fn address(seed: [u8; 32]) -> Address {
    signer(seed).address()
}

/// The scenario channel address
pub fn multisig() -> Address {
    Address::new(MULTISIG)
}

/// Payment app state holding the given balances
pub fn payment_app_state(alice_balance: u64, bob_balance: u64) -> AppState {
    AppState::new(json!({
        "aliceBalance": alice_balance.to_string(),
        "bobBalance": bob_balance.to_string(),
    }))
}
