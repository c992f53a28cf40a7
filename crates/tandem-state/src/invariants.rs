//! Commit-time invariant checks
//!
//! Run by the store against the state a transition would produce, before
//! anything is persisted. A failure rejects the commit and leaves both the
//! persisted and the in-memory state untouched.

use tandem_core::Address;

use crate::channel::ChannelState;
use crate::error::StateError;
use crate::transition::StagedTransition;

/// Check `after` against `before` for the given transition
pub fn check_commit(
    before: Option<&ChannelState>,
    after: &ChannelState,
    transition: &StagedTransition,
) -> Result<(), StateError> {
    check_participants(after)?;
    check_apps(after)?;
    check_nonces(before, after, transition)?;
    check_conservation(before, after, transition)
}

fn check_participants(after: &ChannelState) -> Result<(), StateError> {
    let free_balance = &after.free_balance;
    let not_a_participant = |address: &Address| StateError::NotAParticipant {
        address: address.clone(),
        multisig: after.multisig_address.clone(),
    };

    if free_balance.alice >= free_balance.bob {
        return Err(not_a_participant(&free_balance.bob));
    }
    if after.me == after.counter_party {
        return Err(not_a_participant(&after.counter_party));
    }
    after.ensure_parties(&after.me, &after.counter_party)
}

fn check_apps(after: &ChannelState) -> Result<(), StateError> {
    for (app_id, app) in &after.app_channels {
        if *app_id != app.app_id {
            return Err(StateError::Corrupt {
                key: app_id.to_string(),
                reason: format!("app channel is filed under {app_id} but names {}", app.app_id),
            });
        }
        after.ensure_parties(&app.peer_a.address, &app.peer_b.address)?;
        if app.peer_a.address != after.free_balance.alice
            || app.peer_b.address != after.free_balance.bob
        {
            return Err(StateError::PeerOrder {
                app_id: app_id.clone(),
            });
        }
        app.verify_state_hash()?;
        if app.local_nonce == 0 {
            return Err(StateError::NonceMismatch {
                app_id: app_id.clone(),
                expected: 1,
                found: 0,
            });
        }
        if app.dependency_nonce != after.dependency_nonce {
            return Err(StateError::DependencyNonceMismatch {
                before: after.dependency_nonce.nonce.saturating_sub(1),
                found: app.dependency_nonce.nonce,
            });
        }
    }
    Ok(())
}

fn check_nonces(
    before: Option<&ChannelState>,
    after: &ChannelState,
    transition: &StagedTransition,
) -> Result<(), StateError> {
    let before_dependency = before.map_or(0, |channel| channel.dependency_nonce.nonce);

    match transition {
        StagedTransition::Setup { .. } => {
            if after.dependency_nonce.nonce != 0 || !after.app_channels.is_empty() {
                return Err(StateError::DependencyNonceMismatch {
                    before: 0,
                    found: after.dependency_nonce.nonce,
                });
            }
        }
        StagedTransition::Install { app_id, .. } => {
            if before.is_some_and(|channel| channel.app_channels.contains_key(app_id)) {
                return Err(StateError::AppExists {
                    app_id: app_id.clone(),
                });
            }
            let app = after.app(app_id)?;
            if app.local_nonce != 1 {
                return Err(StateError::NonceMismatch {
                    app_id: app_id.clone(),
                    expected: 1,
                    found: app.local_nonce,
                });
            }
            check_dependency_step(before_dependency, after)?;
        }
        StagedTransition::Update {
            app_id,
            prior_nonce,
            ..
        } => {
            let found = after.app(app_id)?.local_nonce;
            if found != prior_nonce + 1 {
                return Err(StateError::NonceMismatch {
                    app_id: app_id.clone(),
                    expected: prior_nonce + 1,
                    found,
                });
            }
            if after.dependency_nonce.nonce != before_dependency {
                return Err(StateError::DependencyNonceMismatch {
                    before: before_dependency.saturating_sub(1),
                    found: after.dependency_nonce.nonce,
                });
            }
        }
        StagedTransition::Uninstall { app_id, .. } => {
            if after.app_channels.contains_key(app_id) {
                return Err(StateError::AppExists {
                    app_id: app_id.clone(),
                });
            }
            check_dependency_step(before_dependency, after)?;
        }
    }
    Ok(())
}

fn check_dependency_step(before: u64, after: &ChannelState) -> Result<(), StateError> {
    if after.dependency_nonce.nonce != before + 1 {
        return Err(StateError::DependencyNonceMismatch {
            before,
            found: after.dependency_nonce.nonce,
        });
    }
    Ok(())
}

fn check_conservation(
    before: Option<&ChannelState>,
    after: &ChannelState,
    transition: &StagedTransition,
) -> Result<(), StateError> {
    let before_total = before.map_or(0, |channel| to_i128(channel.total_value()));
    let expected = before_total + transition.value_delta(before);
    let found = to_i128(after.total_value());
    if expected != found {
        return Err(StateError::ConservationViolated {
            multisig: after.multisig_address.clone(),
            expected,
            found,
        });
    }
    Ok(())
}

fn to_i128(value: u128) -> i128 {
    i128::try_from(value).unwrap_or(i128::MAX)
}
