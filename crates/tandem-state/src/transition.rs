//! Staged state transitions
//!
//! A protocol run never mutates channel state while it is in flight. Its
//! first step computes a `StagedTransition` from the initiating message and
//! the current channel snapshot; both peers sign the transition's digest,
//! and only the final step hands it to the store for commit. The staged value
//! is journaled with the cursor, so a resumed run commits exactly what was
//! signed.

use serde::{Deserialize, Serialize};
use tandem_core::{Address, AppId, ClientActionMessage, Digest, ProtocolName, ProtocolPayload};

use crate::channel::{AppChannelState, ChannelState, FreeBalanceState, PeerBalance};
use crate::error::StateError;

/// A channel mutation agreed on by a protocol run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum StagedTransition {
    /// Create the channel with an empty free balance
    Setup {
        /// Channel identity
        multisig_address: Address,
        /// Lower-sorting participant
        alice: Address,
        /// Higher-sorting participant
        bob: Address,
    },
    /// Lock deposits from the free balance into a new app channel
    Install {
        /// Channel identity
        multisig_address: Address,
        /// Derived app identifier
        app_id: AppId,
        /// Application name
        app_name: String,
        /// Channel's `alice` and its deposit
        peer_a: PeerBalance,
        /// Channel's `bob` and its deposit
        peer_b: PeerBalance,
        /// Initial encoded app state
        encoded_state: String,
        /// Hash of the initial encoded state
        app_state_hash: String,
    },
    /// Replace an app's state, advancing its local nonce
    Update {
        /// Channel identity
        multisig_address: Address,
        /// Target app
        app_id: AppId,
        /// Local nonce the update was staged against
        prior_nonce: u64,
        /// New encoded app state
        encoded_state: String,
        /// Hash of the new encoded state
        app_state_hash: String,
    },
    /// Remove an app and credit the settlement to the free balance
    Uninstall {
        /// Channel identity
        multisig_address: Address,
        /// Target app
        app_id: AppId,
        /// Local nonce the uninstall was staged against
        prior_nonce: u64,
        /// Amount credited to the channel's `alice`
        alice_amount: u64,
        /// Amount credited to the channel's `bob`
        bob_amount: u64,
    },
}

impl StagedTransition {
    /// Compute the transition requested by a protocol message
    ///
    /// Pure: reads the snapshot, never mutates it. Both peers call this with
    /// the initiating message and must arrive at the same value.
    pub fn propose(
        message: &ClientActionMessage,
        snapshot: Option<&ChannelState>,
    ) -> Result<Self, StateError> {
        let (responder, initiator) = message.initiating_parties();
        let multisig = &message.multisig_address;

        match &message.payload {
            ProtocolPayload::Setup => {
                if snapshot.is_some() {
                    return Err(StateError::ChannelExists {
                        multisig: multisig.clone(),
                    });
                }
                let (alice, bob) = initiator.sorted_pair(responder);
                Ok(StagedTransition::Setup {
                    multisig_address: multisig.clone(),
                    alice: alice.clone(),
                    bob: bob.clone(),
                })
            }
            ProtocolPayload::Install(params) => {
                let channel = require_channel(snapshot, multisig)?;
                channel.ensure_parties(initiator, responder)?;

                let app_id = AppId::derive(multisig, &message.request_id, &params.app_name);
                if channel.app_channels.contains_key(&app_id) {
                    return Err(StateError::AppExists { app_id });
                }
                for (address, needed) in [
                    (initiator, params.peer_a_balance),
                    (responder, params.peer_b_balance),
                ] {
                    let available = channel.free_balance.balance_of(address).unwrap_or(0);
                    if available < needed {
                        return Err(StateError::InsufficientFreeBalance {
                            address: address.clone(),
                            needed,
                            available,
                        });
                    }
                }

                let initiator_deposit = PeerBalance {
                    address: initiator.clone(),
                    balance: params.peer_a_balance,
                };
                let responder_deposit = PeerBalance {
                    address: responder.clone(),
                    balance: params.peer_b_balance,
                };
                let (peer_a, peer_b) = if *initiator == channel.free_balance.alice {
                    (initiator_deposit, responder_deposit)
                } else {
                    (responder_deposit, initiator_deposit)
                };

                Ok(StagedTransition::Install {
                    multisig_address: multisig.clone(),
                    app_id,
                    app_name: params.app_name.clone(),
                    peer_a,
                    peer_b,
                    encoded_state: params.state.encode(),
                    app_state_hash: params.state.state_hash(),
                })
            }
            ProtocolPayload::Update(params) => {
                let channel = require_channel(snapshot, multisig)?;
                channel.ensure_parties(initiator, responder)?;
                let app = channel.app(require_app_id(message)?)?;

                Ok(StagedTransition::Update {
                    multisig_address: multisig.clone(),
                    app_id: app.app_id.clone(),
                    prior_nonce: app.local_nonce,
                    encoded_state: params.state.encode(),
                    app_state_hash: params.state.state_hash(),
                })
            }
            ProtocolPayload::Uninstall(params) => {
                let channel = require_channel(snapshot, multisig)?;
                channel.ensure_parties(initiator, responder)?;
                let app = channel.app(require_app_id(message)?)?;

                let (alice_amount, bob_amount) = if *initiator == channel.free_balance.alice {
                    (params.peer_a_balance, params.peer_b_balance)
                } else {
                    (params.peer_b_balance, params.peer_a_balance)
                };

                Ok(StagedTransition::Uninstall {
                    multisig_address: multisig.clone(),
                    app_id: app.app_id.clone(),
                    prior_nonce: app.local_nonce,
                    alice_amount,
                    bob_amount,
                })
            }
        }
    }

    /// Protocol that produces this kind of transition
    pub fn protocol_name(&self) -> ProtocolName {
        match self {
            StagedTransition::Setup { .. } => ProtocolName::Setup,
            StagedTransition::Install { .. } => ProtocolName::Install,
            StagedTransition::Update { .. } => ProtocolName::Update,
            StagedTransition::Uninstall { .. } => ProtocolName::Uninstall,
        }
    }

    /// Channel the transition applies to
    pub fn multisig_address(&self) -> &Address {
        match self {
            StagedTransition::Setup {
                multisig_address, ..
            }
            | StagedTransition::Install {
                multisig_address, ..
            }
            | StagedTransition::Update {
                multisig_address, ..
            }
            | StagedTransition::Uninstall {
                multisig_address, ..
            } => multisig_address,
        }
    }

    /// App the transition targets, if any
    pub fn app_id(&self) -> Option<&AppId> {
        match self {
            StagedTransition::Setup { .. } => None,
            StagedTransition::Install { app_id, .. }
            | StagedTransition::Update { app_id, .. }
            | StagedTransition::Uninstall { app_id, .. } => Some(app_id),
        }
    }

    /// Commitment both peers sign
    pub fn digest(&self) -> Result<Digest, StateError> {
        let bytes = serde_json::to_vec(self).map_err(|e| StateError::Encode(e.to_string()))?;
        Ok(Digest::of(&bytes))
    }

    /// Change in total channel value this transition is allowed to make
    ///
    /// Zero for everything but uninstall, which swaps the app's locked value
    /// for the settled amounts.
    pub fn value_delta(&self, before: Option<&ChannelState>) -> i128 {
        match self {
            StagedTransition::Uninstall {
                app_id,
                alice_amount,
                bob_amount,
                ..
            } => {
                let locked = before
                    .and_then(|channel| channel.app_channels.get(app_id))
                    .map_or(0, AppChannelState::locked_value);
                let settled = u128::from(*alice_amount) + u128::from(*bob_amount);
                to_i128(settled) - to_i128(locked)
            }
            _ => 0,
        }
    }

    /// Whether `current` already reflects this transition
    ///
    /// Lets a run that crashed between commit and log clear finish without
    /// applying twice.
    pub fn is_applied(&self, current: Option<&ChannelState>) -> bool {
        let Some(channel) = current else {
            return false;
        };
        match self {
            StagedTransition::Setup { alice, bob, .. } => {
                channel.free_balance.alice == *alice && channel.free_balance.bob == *bob
            }
            StagedTransition::Install { app_id, .. } => channel.app_channels.contains_key(app_id),
            StagedTransition::Update {
                app_id,
                prior_nonce,
                app_state_hash,
                ..
            } => channel.app_channels.get(app_id).is_some_and(|app| {
                app.local_nonce == prior_nonce + 1 && app.app_state_hash == *app_state_hash
            }),
            StagedTransition::Uninstall { app_id, .. } => {
                !channel.app_channels.contains_key(app_id)
            }
        }
    }

    /// Produce the channel state after this transition
    pub fn apply(
        &self,
        me: &Address,
        current: Option<&ChannelState>,
    ) -> Result<ChannelState, StateError> {
        match self {
            StagedTransition::Setup {
                multisig_address,
                alice,
                bob,
            } => {
                if current.is_some() {
                    return Err(StateError::ChannelExists {
                        multisig: multisig_address.clone(),
                    });
                }
                let counter_party = if me == alice {
                    bob
                } else if me == bob {
                    alice
                } else {
                    return Err(StateError::NotAParticipant {
                        address: me.clone(),
                        multisig: multisig_address.clone(),
                    });
                };
                Ok(ChannelState::open(
                    me.clone(),
                    counter_party.clone(),
                    multisig_address.clone(),
                ))
            }
            StagedTransition::Install {
                multisig_address,
                app_id,
                app_name,
                peer_a,
                peer_b,
                encoded_state,
                app_state_hash,
            } => {
                let mut next = require_channel(current, multisig_address)?.clone();
                if next.app_channels.contains_key(app_id) {
                    return Err(StateError::AppExists {
                        app_id: app_id.clone(),
                    });
                }
                debit(&mut next.free_balance, multisig_address, peer_a)?;
                debit(&mut next.free_balance, multisig_address, peer_b)?;

                next.dependency_nonce = next.dependency_nonce.next();
                next.app_channels.insert(
                    app_id.clone(),
                    AppChannelState {
                        app_id: app_id.clone(),
                        app_name: app_name.clone(),
                        peer_a: peer_a.clone(),
                        peer_b: peer_b.clone(),
                        encoded_state: encoded_state.clone(),
                        app_state_hash: app_state_hash.clone(),
                        local_nonce: 1,
                        dependency_nonce: next.dependency_nonce,
                    },
                );
                propagate_dependency_nonce(&mut next);
                Ok(next)
            }
            StagedTransition::Update {
                multisig_address,
                app_id,
                prior_nonce,
                encoded_state,
                app_state_hash,
            } => {
                let mut next = require_channel(current, multisig_address)?.clone();
                let app = next
                    .app_channels
                    .get_mut(app_id)
                    .ok_or_else(|| StateError::UnknownApp {
                        app_id: app_id.clone(),
                    })?;
                check_nonce(app, *prior_nonce)?;

                app.encoded_state = encoded_state.clone();
                app.app_state_hash = app_state_hash.clone();
                app.local_nonce += 1;
                Ok(next)
            }
            StagedTransition::Uninstall {
                multisig_address,
                app_id,
                prior_nonce,
                alice_amount,
                bob_amount,
            } => {
                let mut next = require_channel(current, multisig_address)?.clone();
                let app = next.app(app_id)?;
                check_nonce(app, *prior_nonce)?;
                next.app_channels.remove(app_id);

                let overflow = || StateError::BalanceOverflow {
                    multisig: multisig_address.clone(),
                };
                next.free_balance.alice_balance = next
                    .free_balance
                    .alice_balance
                    .checked_add(*alice_amount)
                    .ok_or_else(overflow)?;
                next.free_balance.bob_balance = next
                    .free_balance
                    .bob_balance
                    .checked_add(*bob_amount)
                    .ok_or_else(overflow)?;

                next.dependency_nonce = next.dependency_nonce.next();
                propagate_dependency_nonce(&mut next);
                Ok(next)
            }
        }
    }
}

fn require_channel<'a>(
    snapshot: Option<&'a ChannelState>,
    multisig: &Address,
) -> Result<&'a ChannelState, StateError> {
    snapshot.ok_or_else(|| StateError::UnknownChannel {
        multisig: multisig.clone(),
    })
}

fn require_app_id(message: &ClientActionMessage) -> Result<&AppId, StateError> {
    message
        .app_id
        .as_ref()
        .ok_or(StateError::MissingAppId(message.protocol_name()))
}

fn check_nonce(app: &AppChannelState, expected: u64) -> Result<(), StateError> {
    if app.local_nonce != expected {
        return Err(StateError::NonceMismatch {
            app_id: app.app_id.clone(),
            expected,
            found: app.local_nonce,
        });
    }
    Ok(())
}

fn debit(
    free_balance: &mut FreeBalanceState,
    multisig: &Address,
    peer: &PeerBalance,
) -> Result<(), StateError> {
    let slot = if peer.address == free_balance.alice {
        &mut free_balance.alice_balance
    } else if peer.address == free_balance.bob {
        &mut free_balance.bob_balance
    } else {
        return Err(StateError::NotAParticipant {
            address: peer.address.clone(),
            multisig: multisig.clone(),
        });
    };
    *slot = slot
        .checked_sub(peer.balance)
        .ok_or_else(|| StateError::InsufficientFreeBalance {
            address: peer.address.clone(),
            needed: peer.balance,
            available: *slot,
        })?;
    Ok(())
}

fn propagate_dependency_nonce(channel: &mut ChannelState) {
    let nonce = channel.dependency_nonce;
    for app in channel.app_channels.values_mut() {
        app.dependency_nonce = nonce;
    }
}

fn to_i128(value: u128) -> i128 {
    i128::try_from(value).unwrap_or(i128::MAX)
}
