//! Crash, restart and hostile-message scenarios
//!
//! Messages are delivered by hand so each test decides which peer sees what,
//! and when. Request ids are fixed so app ids match across harnesses.

#![allow(clippy::unwrap_used)]

use assert_matches::assert_matches;
use std::sync::Arc;
use tandem_core::{
    AppId, ClientActionMessage, EngineConfig, InstallParams, ProtocolPayload, RequestId,
    Signature, StorageEffects, UpdateParams,
};
use tandem_effects::FilesystemStorageHandler;
use tandem_protocol::{Completion, DispatchOutcome, ProtocolError};
use tandem_state::ChannelState;
use tandem_testkit::{
    init_tracing, multisig, payment_app_state, Party, TwoPartyHarness, PAYMENT_APP,
};
use tempfile::TempDir;

const INSTALL_ID: &str = "install-1";

fn request(
    harness: &TwoPartyHarness,
    from: Party,
    request_id: &str,
    app_id: Option<AppId>,
    payload: ProtocolPayload,
) -> ClientActionMessage {
    ClientActionMessage::initiate(
        harness.address(from),
        harness.address(from.other()),
        multisig(),
        app_id,
        RequestId::new(request_id),
        payload,
    )
}

fn install_request(harness: &TwoPartyHarness) -> ClientActionMessage {
    request(
        harness,
        Party::Alice,
        INSTALL_ID,
        None,
        ProtocolPayload::Install(InstallParams {
            app_name: PAYMENT_APP.to_string(),
            peer_a_balance: 0,
            peer_b_balance: 0,
            state: payment_app_state(10, 10),
        }),
    )
}

fn installed_app() -> AppId {
    AppId::derive(&multisig(), &RequestId::new(INSTALL_ID), PAYMENT_APP)
}

async fn deliver_ok(harness: &TwoPartyHarness) -> anyhow::Result<()> {
    for delivery in harness.deliver_all().await {
        delivery.outcome?;
    }
    Ok(())
}

async fn open_channel(harness: &TwoPartyHarness) -> anyhow::Result<()> {
    let setup = request(harness, Party::Alice, "setup-1", None, ProtocolPayload::Setup);
    harness.engine(Party::Alice).execute(setup).await?;
    deliver_ok(harness).await
}

/// Both views of the channel after an install nobody interrupted
async fn reference_install() -> anyhow::Result<(ChannelState, ChannelState)> {
    let harness = TwoPartyHarness::in_memory().await?;
    open_channel(&harness).await?;
    harness
        .engine(Party::Alice)
        .execute(install_request(&harness))
        .await?;
    deliver_ok(&harness).await?;
    Ok((
        harness.channel_state(Party::Alice)?,
        harness.channel_state(Party::Bob)?,
    ))
}

#[tokio::test]
async fn responder_crash_at_every_step_converges() -> anyhow::Result<()> {
    init_tracing();
    let (alice_reference, bob_reference) = reference_install().await?;
    assert_eq!(bob_reference.app_channels.len(), 1);

    // Bob journals five steps and then clears; stop him after each write
    for writes in 1..=5 {
        let mut harness = TwoPartyHarness::in_memory().await?;
        open_channel(&harness).await?;

        harness.storage(Party::Bob).fail_after(writes);
        harness
            .engine(Party::Alice)
            .execute(install_request(&harness))
            .await?;
        let deliveries = harness.deliver_all().await;
        assert!(
            deliveries
                .iter()
                .any(|d| matches!(d.outcome, Err(ProtocolError::Wal(_)))),
            "bob should fail after {writes} writes"
        );

        harness.storage(Party::Bob).heal();
        harness.crash(Party::Bob);
        harness.restart(Party::Bob).await?;
        deliver_ok(&harness).await?;

        assert_eq!(harness.channel_state(Party::Alice)?, alice_reference, "writes={writes}");
        assert_eq!(harness.channel_state(Party::Bob)?, bob_reference, "writes={writes}");
        assert!(harness.engine(Party::Alice).in_flight().is_empty());
        assert!(harness.engine(Party::Bob).in_flight().is_empty());
        assert_eq!(harness.network().pending(), 0);
    }
    Ok(())
}

#[tokio::test]
async fn initiator_restart_while_awaiting_reply() -> anyhow::Result<()> {
    init_tracing();
    let (alice_reference, bob_reference) = reference_install().await?;
    let mut harness = TwoPartyHarness::in_memory().await?;
    open_channel(&harness).await?;

    let outcome = harness
        .engine(Party::Alice)
        .execute(install_request(&harness))
        .await?;
    assert_matches!(outcome, DispatchOutcome::Suspended { awaiting: Some(1), .. });

    harness.crash(Party::Alice);
    deliver_ok(&harness).await?;
    // Bob committed; his reply waits for Alice
    assert_eq!(harness.channel_state(Party::Bob)?, bob_reference);
    assert_eq!(harness.network().pending(), 1);

    let alice = harness.restart(Party::Alice).await?;
    let resumed = alice.in_flight();
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].action.request_id, RequestId::new(INSTALL_ID));
    assert!(harness.channel_state(Party::Alice)?.app_channels.is_empty());
    // The resumed cursor sent its proposal again
    assert_eq!(harness.network().pending(), 2);

    // Bob answers the repeat from his settled run without applying it again
    deliver_ok(&harness).await?;
    assert_eq!(harness.channel_state(Party::Alice)?, alice_reference);
    assert_eq!(harness.channel_state(Party::Bob)?, bob_reference);
    assert!(alice.in_flight().is_empty());
    assert_eq!(harness.network().pending(), 0);
    Ok(())
}

#[tokio::test]
async fn crash_between_commit_and_clear_does_not_reapply() -> anyhow::Result<()> {
    init_tracing();
    let mut harness = TwoPartyHarness::in_memory().await?;
    open_channel(&harness).await?;
    harness
        .engine(Party::Alice)
        .execute(install_request(&harness))
        .await?;
    deliver_ok(&harness).await?;

    // Six journal writes take Alice through her pipeline; the clear fails
    harness.storage(Party::Alice).fail_after(6);
    let update = request(
        &harness,
        Party::Alice,
        "update-1",
        Some(installed_app()),
        ProtocolPayload::Update(UpdateParams {
            state: payment_app_state(4, 16),
        }),
    );
    harness.engine(Party::Alice).execute(update).await?;
    let deliveries = harness.deliver_all().await;
    assert_matches!(
        deliveries.last().map(|d| &d.outcome),
        Some(Err(ProtocolError::Wal(_)))
    );
    let committed = harness.channel_state(Party::Alice)?;
    assert_eq!(committed.app(&installed_app())?.local_nonce, 2);
    assert_eq!(harness.engine(Party::Alice).in_flight().len(), 1);

    harness.storage(Party::Alice).heal();
    harness.restart(Party::Alice).await?;

    assert!(harness.engine(Party::Alice).in_flight().is_empty());
    for party in [Party::Alice, Party::Bob] {
        let app = harness.channel_state(party)?.app(&installed_app())?.clone();
        assert_eq!(app.local_nonce, 2);
        assert_eq!(app.app_state_hash, payment_app_state(4, 16).state_hash());
    }
    assert_eq!(harness.channel_state(Party::Alice)?, committed);
    Ok(())
}

#[tokio::test]
async fn second_request_on_a_busy_key_collides() -> anyhow::Result<()> {
    init_tracing();
    let harness = TwoPartyHarness::in_memory().await?;
    open_channel(&harness).await?;
    let alice = harness.engine(Party::Alice);

    alice.execute(install_request(&harness)).await?;
    let before = alice.in_flight();

    // Any two installs on one channel share a log key
    let mut second = install_request(&harness);
    second.request_id = RequestId::new("install-2");
    let err = alice.execute(second).await.unwrap_err();
    assert_matches!(err, ProtocolError::KeyCollision { ref in_flight, .. } if in_flight.as_str() == INSTALL_ID);

    // Re-submitting the in-flight request re-sends its proposal
    assert_matches!(
        alice.execute(install_request(&harness)).await?,
        DispatchOutcome::Suspended { awaiting: Some(1), .. }
    );
    let mut proposals = harness.network().drain();
    assert_eq!(proposals.len(), 2);
    assert_eq!(proposals[0], proposals[1]);

    // A reply for another request on the same key is rejected the same way
    let proposal = proposals.remove(0);
    let mut stray = proposal.reply(Signature::from_bytes(vec![0; 64]));
    stray.request_id = RequestId::new("install-2");
    let err = alice.receive(stray).await.unwrap_err();
    assert_matches!(err, ProtocolError::KeyCollision { .. });

    assert_eq!(alice.in_flight(), before);
    harness.network().inject(proposal);
    deliver_ok(&harness).await?;
    assert!(alice.in_flight().is_empty());
    Ok(())
}

#[tokio::test]
async fn mismatched_reply_leaves_cursor_in_place() -> anyhow::Result<()> {
    init_tracing();
    let harness = TwoPartyHarness::in_memory().await?;
    open_channel(&harness).await?;
    let alice = harness.engine(Party::Alice);

    alice.execute(install_request(&harness)).await?;
    let before = alice.in_flight();
    let proposal = harness.network().drain().remove(0);

    let mut altered = proposal.reply(Signature::from_bytes(vec![0; 64]));
    if let ProtocolPayload::Install(params) = &mut altered.payload {
        params.peer_b_balance = 1;
    }
    assert_matches!(
        alice.receive(altered).await,
        Err(ProtocolError::ResumptionMismatch { .. })
    );

    let mut out_of_order = proposal.reply(Signature::from_bytes(vec![0; 64]));
    out_of_order.seq = 3;
    assert_matches!(
        alice.receive(out_of_order).await,
        Err(ProtocolError::ResumptionMismatch { .. })
    );

    assert_eq!(alice.in_flight(), before);
    assert!(harness.channel_state(Party::Alice)?.app_channels.is_empty());

    harness.network().inject(proposal);
    deliver_ok(&harness).await?;
    assert_eq!(harness.channel_state(Party::Alice)?.app_channels.len(), 1);
    Ok(())
}

#[tokio::test]
async fn reply_without_cursor_is_unrecognized() -> anyhow::Result<()> {
    init_tracing();
    let harness = TwoPartyHarness::in_memory().await?;
    open_channel(&harness).await?;
    let before = harness.channel_state(Party::Alice)?;

    let ghost = install_request(&harness).reply(Signature::from_bytes(vec![0; 64]));
    let result = harness.engine(Party::Alice).receive(ghost).await;

    assert_matches!(result, Err(ProtocolError::Unrecognized { .. }));
    assert_eq!(harness.channel_state(Party::Alice)?, before);
    assert!(harness.engine(Party::Alice).in_flight().is_empty());
    Ok(())
}

#[tokio::test]
async fn tampered_proposal_is_aborted_by_responder() -> anyhow::Result<()> {
    init_tracing();
    let mut harness = TwoPartyHarness::in_memory().await?;
    open_channel(&harness).await?;
    let before = harness.channel_state(Party::Bob)?;

    harness
        .engine(Party::Alice)
        .execute(install_request(&harness))
        .await?;
    let mut proposal = harness.network().drain().remove(0);
    if let ProtocolPayload::Install(params) = &mut proposal.payload {
        params.state = payment_app_state(0, 20);
    }
    harness.network().inject(proposal);

    let deliveries = harness.deliver_all().await;
    assert_eq!(deliveries.len(), 1);
    assert_matches!(deliveries[0].outcome, Err(ProtocolError::Signature(_)));

    assert_eq!(harness.channel_state(Party::Bob)?, before);
    assert!(harness.engine(Party::Bob).in_flight().is_empty());
    assert_eq!(harness.network().pending(), 0);
    // Nothing of the aborted run survives a restart
    let bob = harness.restart(Party::Bob).await?;
    assert!(bob.in_flight().is_empty());
    // Alice keeps waiting for a reply that never comes
    assert_eq!(harness.engine(Party::Alice).in_flight().len(), 1);
    Ok(())
}

#[tokio::test]
async fn filesystem_stores_survive_full_restart() -> anyhow::Result<()> {
    init_tracing();
    let (alice_reference, bob_reference) = reference_install().await?;
    let alice_dir = TempDir::new()?;
    let bob_dir = TempDir::new()?;
    let open = |dir: &TempDir| -> Arc<dyn StorageEffects> {
        Arc::new(FilesystemStorageHandler::new(dir.path().to_path_buf()))
    };

    let in_transit = {
        let harness =
            TwoPartyHarness::new(EngineConfig::default(), open(&alice_dir), open(&bob_dir)).await?;
        open_channel(&harness).await?;
        harness
            .engine(Party::Alice)
            .execute(install_request(&harness))
            .await?;
        harness.network().drain()
    };
    assert_eq!(in_transit.len(), 1);

    // Fresh handlers, engines and network over the same directories
    let harness =
        TwoPartyHarness::new(EngineConfig::default(), open(&alice_dir), open(&bob_dir)).await?;
    assert_eq!(harness.engine(Party::Alice).in_flight().len(), 1);
    assert_eq!(harness.channel_state(Party::Bob)?.dependency_nonce.nonce, 0);

    // Alice's resumed cursor puts the lost proposal back on the wire
    assert_eq!(harness.network().drain(), in_transit);
    for message in in_transit {
        harness.network().inject(message);
    }
    deliver_ok(&harness).await?;

    assert_eq!(harness.channel_state(Party::Alice)?, alice_reference);
    assert_eq!(harness.channel_state(Party::Bob)?, bob_reference);
    assert!(harness.engine(Party::Alice).in_flight().is_empty());
    Ok(())
}

#[tokio::test]
async fn responder_send_failure_recovers_on_restart() -> anyhow::Result<()> {
    init_tracing();
    let (alice_reference, bob_reference) = reference_install().await?;
    let mut harness = TwoPartyHarness::in_memory().await?;
    open_channel(&harness).await?;

    harness.network().fail_sends(&harness.address(Party::Bob), 1);
    harness
        .engine(Party::Alice)
        .execute(install_request(&harness))
        .await?;
    let deliveries = harness.deliver_all().await;
    assert_eq!(deliveries.len(), 1);
    assert_matches!(deliveries[0].outcome, Err(ProtocolError::Transport(_)));
    // The reply is journaled but neither sent nor committed
    assert_eq!(harness.engine(Party::Bob).in_flight().len(), 1);
    assert!(harness.channel_state(Party::Bob)?.app_channels.is_empty());
    assert_eq!(harness.network().pending(), 0);

    harness.restart(Party::Bob).await?;
    assert_eq!(harness.network().pending(), 1);
    deliver_ok(&harness).await?;

    assert_eq!(harness.channel_state(Party::Alice)?, alice_reference);
    assert_eq!(harness.channel_state(Party::Bob)?, bob_reference);
    assert!(harness.engine(Party::Alice).in_flight().is_empty());
    assert!(harness.engine(Party::Bob).in_flight().is_empty());
    Ok(())
}

#[tokio::test]
async fn responder_send_failure_recovers_on_redelivery() -> anyhow::Result<()> {
    init_tracing();
    let (alice_reference, bob_reference) = reference_install().await?;
    let harness = TwoPartyHarness::in_memory().await?;
    open_channel(&harness).await?;

    harness.network().fail_sends(&harness.address(Party::Bob), 1);
    let alice = harness.engine(Party::Alice);
    alice.execute(install_request(&harness)).await?;
    let deliveries = harness.deliver_all().await;
    assert_matches!(deliveries[0].outcome, Err(ProtocolError::Transport(_)));

    // Alice repeats her request; Bob answers from his journal instead of
    // staging the install a second time
    alice.execute(install_request(&harness)).await?;
    let deliveries = harness.deliver_all().await;
    assert_eq!(deliveries.len(), 2);
    assert_matches!(
        deliveries[0].outcome,
        Ok(DispatchOutcome::Committed(Completion { already_applied: false, .. }))
    );
    assert_matches!(deliveries[1].outcome, Ok(DispatchOutcome::Committed(_)));

    assert_eq!(harness.channel_state(Party::Alice)?, alice_reference);
    assert_eq!(harness.channel_state(Party::Bob)?, bob_reference);
    assert!(harness.engine(Party::Bob).in_flight().is_empty());
    Ok(())
}

#[tokio::test]
async fn duplicate_proposal_after_commit_is_answered_again() -> anyhow::Result<()> {
    init_tracing();
    let (alice_reference, bob_reference) = reference_install().await?;
    let harness = TwoPartyHarness::in_memory().await?;
    open_channel(&harness).await?;

    harness
        .engine(Party::Alice)
        .execute(install_request(&harness))
        .await?;
    let proposal = harness.network().drain().remove(0);
    harness.network().inject(proposal.clone());
    deliver_ok(&harness).await?;

    harness.network().inject(proposal);
    let deliveries = harness.deliver_all().await;
    assert_eq!(deliveries.len(), 2);
    assert_matches!(
        deliveries[0].outcome,
        Ok(DispatchOutcome::Committed(Completion { already_applied: true, .. }))
    );
    assert_matches!(
        deliveries[1].outcome,
        Ok(DispatchOutcome::Committed(Completion { already_applied: true, .. }))
    );

    assert_eq!(harness.channel_state(Party::Alice)?, alice_reference);
    assert_eq!(harness.channel_state(Party::Bob)?, bob_reference);
    Ok(())
}

#[tokio::test]
async fn initiator_send_failure_recovers_on_restart() -> anyhow::Result<()> {
    init_tracing();
    let (alice_reference, bob_reference) = reference_install().await?;
    let mut harness = TwoPartyHarness::in_memory().await?;
    open_channel(&harness).await?;

    harness.network().fail_sends(&harness.address(Party::Alice), 1);
    let err = harness
        .engine(Party::Alice)
        .execute(install_request(&harness))
        .await
        .unwrap_err();
    assert_matches!(err, ProtocolError::Transport(_));
    assert_eq!(harness.engine(Party::Alice).in_flight().len(), 1);
    assert_eq!(harness.network().pending(), 0);

    harness.restart(Party::Alice).await?;
    assert_eq!(harness.network().pending(), 1);
    deliver_ok(&harness).await?;

    assert_eq!(harness.channel_state(Party::Alice)?, alice_reference);
    assert_eq!(harness.channel_state(Party::Bob)?, bob_reference);
    assert!(harness.engine(Party::Alice).in_flight().is_empty());
    Ok(())
}

#[tokio::test]
async fn abort_releases_a_stuck_key() -> anyhow::Result<()> {
    init_tracing();
    let harness = TwoPartyHarness::in_memory().await?;
    open_channel(&harness).await?;
    let alice = harness.engine(Party::Alice);

    harness.network().fail_sends(&harness.address(Party::Alice), 1);
    let done = alice.subscribe(&RequestId::new(INSTALL_ID));
    assert!(alice.execute(install_request(&harness)).await.is_err());
    let key = alice.in_flight()[0].log_key();

    let mut second = install_request(&harness);
    second.request_id = RequestId::new("install-2");
    assert_matches!(
        alice.execute(second.clone()).await,
        Err(ProtocolError::KeyCollision { .. })
    );

    assert!(alice.abort(&key).await?);
    assert_matches!(done.await?, Err(ProtocolError::Cancelled { .. }));
    assert!(alice.in_flight().is_empty());
    assert_eq!(alice.locked_keys(), 0);

    alice.execute(second).await?;
    deliver_ok(&harness).await?;
    let app_id = AppId::derive(&multisig(), &RequestId::new("install-2"), PAYMENT_APP);
    for party in [Party::Alice, Party::Bob] {
        let state = harness.channel_state(party)?;
        assert_eq!(state.app_channels.len(), 1);
        assert!(state.app(&app_id).is_ok());
    }
    Ok(())
}

/// Updates proposed from both ends at once each win on the peer that
/// answers first, so the peers end on different states. Settling that needs
/// an on-chain dispute, which this engine does not run.
#[tokio::test]
async fn opposite_updates_diverge() -> anyhow::Result<()> {
    init_tracing();
    let harness = TwoPartyHarness::in_memory().await?;
    open_channel(&harness).await?;
    harness
        .engine(Party::Alice)
        .execute(install_request(&harness))
        .await?;
    deliver_ok(&harness).await?;

    let update = |from: Party, request_id: &str, state| {
        request(
            &harness,
            from,
            request_id,
            Some(installed_app()),
            ProtocolPayload::Update(UpdateParams { state }),
        )
    };
    let alices = payment_app_state(4, 16);
    let bobs = payment_app_state(16, 4);
    harness
        .engine(Party::Alice)
        .execute(update(Party::Alice, "update-a", alices.clone()))
        .await?;
    harness
        .engine(Party::Bob)
        .execute(update(Party::Bob, "update-b", bobs.clone()))
        .await?;

    // Each proposal commits on its responder; each reply then finds a stale nonce
    let deliveries = harness.deliver_all().await;
    assert_eq!(deliveries.len(), 4);
    assert_matches!(deliveries[0].outcome, Ok(DispatchOutcome::Committed(_)));
    assert_matches!(deliveries[1].outcome, Ok(DispatchOutcome::Committed(_)));
    assert_matches!(deliveries[2].outcome, Err(ProtocolError::State(_)));
    assert_matches!(deliveries[3].outcome, Err(ProtocolError::State(_)));

    let alice_app = harness.channel_state(Party::Alice)?.app(&installed_app())?.clone();
    let bob_app = harness.channel_state(Party::Bob)?.app(&installed_app())?.clone();
    assert_eq!(alice_app.local_nonce, 2);
    assert_eq!(bob_app.local_nonce, 2);
    assert_eq!(alice_app.app_state_hash, bobs.state_hash());
    assert_eq!(bob_app.app_state_hash, alices.state_hash());
    assert!(harness.engine(Party::Alice).in_flight().is_empty());
    assert!(harness.engine(Party::Bob).in_flight().is_empty());
    Ok(())
}
