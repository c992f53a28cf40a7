//! Channel and app channel state records

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tandem_core::app::hash_encoded_state;
use tandem_core::{Address, AppId};

use crate::error::StateError;

/// Counter shared by all app channels of a channel
///
/// Advances by one on every install and uninstall, so a stale app state
/// signed before a sibling app changed can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct DependencyNonce {
    /// Current value
    pub nonce: u64,
}

impl DependencyNonce {
    /// Next value of the counter
    pub fn next(self) -> Self {
        Self {
            nonce: self.nonce + 1,
        }
    }
}

/// Balances not locked in any app, keyed by the channel's sorted parties
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreeBalanceState {
    /// Lower-sorting participant
    pub alice: Address,
    /// Higher-sorting participant
    pub bob: Address,
    /// Free balance of `alice`
    pub alice_balance: u64,
    /// Free balance of `bob`
    pub bob_balance: u64,
}

impl FreeBalanceState {
    /// Empty free balance for two parties, in canonical order
    pub fn zeroed(first: &Address, second: &Address) -> Self {
        let (alice, bob) = first.sorted_pair(second);
        Self {
            alice: alice.clone(),
            bob: bob.clone(),
            alice_balance: 0,
            bob_balance: 0,
        }
    }

    /// Free balance of a participant
    pub fn balance_of(&self, address: &Address) -> Option<u64> {
        if *address == self.alice {
            Some(self.alice_balance)
        } else if *address == self.bob {
            Some(self.bob_balance)
        } else {
            None
        }
    }

    /// Sum of both balances
    pub fn total(&self) -> u128 {
        u128::from(self.alice_balance) + u128::from(self.bob_balance)
    }
}

/// One participant's stake in an app channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerBalance {
    /// Participant address
    pub address: Address,
    /// Amount locked in the app
    pub balance: u64,
}

/// State of one installed app channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppChannelState {
    /// Derived app identifier
    pub app_id: AppId,
    /// Application name given at install
    pub app_name: String,
    /// Initiator of the install
    pub peer_a: PeerBalance,
    /// Counterparty of the install
    pub peer_b: PeerBalance,
    /// Opaque encoding of the current app state
    pub encoded_state: String,
    /// Hash of `encoded_state`
    pub app_state_hash: String,
    /// Per-app version, 1 at install
    pub local_nonce: u64,
    /// Copy of the channel's dependency nonce
    pub dependency_nonce: DependencyNonce,
}

impl AppChannelState {
    /// Value locked in this app
    pub fn locked_value(&self) -> u128 {
        u128::from(self.peer_a.balance) + u128::from(self.peer_b.balance)
    }

    /// Check that `app_state_hash` is the hash of `encoded_state`
    pub fn verify_state_hash(&self) -> Result<(), StateError> {
        let recomputed = hash_encoded_state(&self.encoded_state)
            .map_err(|e| StateError::InvalidAppState(e.to_string()))?;
        if recomputed != self.app_state_hash {
            return Err(StateError::StateHashMismatch {
                app_id: self.app_id.clone(),
            });
        }
        Ok(())
    }
}

/// Canonical state of one channel, as seen by one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelState {
    /// Local participant
    pub me: Address,
    /// Remote participant
    pub counter_party: Address,
    /// Channel identity
    pub multisig_address: Address,
    /// Unlocked balances
    pub free_balance: FreeBalanceState,
    /// Installed app channels
    pub app_channels: BTreeMap<AppId, AppChannelState>,
    /// Channel-wide dependency nonce
    pub dependency_nonce: DependencyNonce,
}

impl ChannelState {
    /// Freshly set-up channel with an empty free balance
    pub fn open(me: Address, counter_party: Address, multisig_address: Address) -> Self {
        let free_balance = FreeBalanceState::zeroed(&me, &counter_party);
        Self {
            me,
            counter_party,
            multisig_address,
            free_balance,
            app_channels: BTreeMap::new(),
            dependency_nonce: DependencyNonce::default(),
        }
    }

    /// Whether the address is one of the two participants
    pub fn is_participant(&self, address: &Address) -> bool {
        *address == self.free_balance.alice || *address == self.free_balance.bob
    }

    /// Fail unless both addresses are the channel's participants
    pub fn ensure_parties(&self, first: &Address, second: &Address) -> Result<(), StateError> {
        for address in [first, second] {
            if !self.is_participant(address) {
                return Err(StateError::NotAParticipant {
                    address: address.clone(),
                    multisig: self.multisig_address.clone(),
                });
            }
        }
        Ok(())
    }

    /// Look up an installed app channel
    pub fn app(&self, app_id: &AppId) -> Result<&AppChannelState, StateError> {
        self.app_channels
            .get(app_id)
            .ok_or_else(|| StateError::UnknownApp {
                app_id: app_id.clone(),
            })
    }

    /// Free balance plus everything locked in apps
    pub fn total_value(&self) -> u128 {
        self.free_balance.total()
            + self
                .app_channels
                .values()
                .map(AppChannelState::locked_value)
                .sum::<u128>()
    }
}
