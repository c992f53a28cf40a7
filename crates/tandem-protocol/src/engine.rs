//! Protocol engine
//!
//! Routes local requests (`execute`) and peer messages (`receive`) to
//! execution cursors, drives each cursor through its pipeline and journals it
//! after every step. Dispatch for one log key is serialized; different keys
//! run concurrently.
//!
//! Ordering rules the engine keeps:
//! - a step's result is in the log before the in-memory cursor moves past it
//! - an outgoing message is in the log before it is handed to the transport
//! - channel state is committed before the log entry is cleared
//!
//! A journaled outgoing message is handed to the transport again when its
//! cursor is resumed on restart, when the initiator repeats the same request,
//! and when the counterparty redelivers the proposal it answers. There is no
//! timer-driven retransmission.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tandem_core::{
    Address, AppId, ClientActionMessage, EngineConfig, ProtocolName, RequestId, SigningEffects,
    StorageEffects, TransportEffects,
};
use tandem_state::ChannelStateStore;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use crate::action::{Action, ExecutionCursor, LogKey, Side};
use crate::error::ProtocolError;
use crate::middleware::{StepContext, StepOutcome, StepResult};
use crate::pipeline::PipelineRegistry;
use crate::wal::WriteAheadLog;

/// Committed runs remembered for answering redelivered messages
const SETTLED_CAPACITY: usize = 64;

/// Effect handlers an engine runs on
#[derive(Clone)]
pub struct EngineEffects {
    /// Durable store shared by the log and the channel state store
    pub storage: Arc<dyn StorageEffects>,
    /// Outbound delivery to the counterparty
    pub transport: Arc<dyn TransportEffects>,
    /// Local key custody
    pub signer: Arc<dyn SigningEffects>,
}

/// Report of a committed protocol instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Protocol instance
    pub request_id: RequestId,
    /// Protocol kind
    pub protocol_name: ProtocolName,
    /// Side the local engine ran
    pub side: Side,
    /// Channel committed to
    pub multisig_address: Address,
    /// App targeted, including the id assigned by an install
    pub app_id: Option<AppId>,
    /// The commit had already happened before a restart or redelivery
    pub already_applied: bool,
}

/// Where a dispatch left its cursor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Cursor is parked in the log waiting for the counterparty
    Suspended {
        /// Log key of the cursor
        key: LogKey,
        /// Sequence number of the awaited message
        awaiting: Option<u32>,
    },
    /// Pipeline finished and its transition is committed
    Committed(Completion),
}

type CompletionSender = oneshot::Sender<Result<Completion, ProtocolError>>;
type KeyLock = Arc<tokio::sync::Mutex<()>>;

/// A committed run and the reply it sent, if it was the responder
#[derive(Debug, Clone)]
struct Settled {
    key: LogKey,
    reply: Option<ClientActionMessage>,
    completion: Completion,
}

/// Resumable two-party protocol engine
pub struct ProtocolEngine {
    me: Address,
    wal: WriteAheadLog,
    channels: ChannelStateStore,
    pipelines: PipelineRegistry,
    transport: Arc<dyn TransportEffects>,
    signer: Arc<dyn SigningEffects>,
    in_flight: Mutex<HashMap<LogKey, ExecutionCursor>>,
    key_locks: Mutex<HashMap<LogKey, KeyLock>>,
    completions: Mutex<HashMap<RequestId, Vec<CompletionSender>>>,
    settled: Mutex<VecDeque<Settled>>,
}

impl std::fmt::Debug for ProtocolEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("me", &self.me)
            .field("in_flight", &self.in_flight.lock().len())
            .finish_non_exhaustive()
    }
}

impl ProtocolEngine {
    /// Start an engine with the default pipelines
    pub async fn start(config: EngineConfig, effects: EngineEffects) -> Result<Self, ProtocolError> {
        Self::start_with_pipelines(config, effects, PipelineRegistry::default()).await
    }

    /// Start an engine: load channel state, read the log, resume every cursor
    ///
    /// Each resumed cursor first re-sends the message its last step
    /// journaled. An unreadable log or channel record fails the start. A
    /// cursor that fails to resume is logged and left in the log.
    #[instrument(skip_all, fields(me = %effects.signer.address()))]
    pub async fn start_with_pipelines(
        config: EngineConfig,
        effects: EngineEffects,
        pipelines: PipelineRegistry,
    ) -> Result<Self, ProtocolError> {
        config
            .validate()
            .map_err(|e| ProtocolError::Invalid(e.to_string()))?;

        let channels = ChannelStateStore::open(effects.storage.clone(), &config.state).await?;
        let wal = WriteAheadLog::new(effects.storage, config.wal);
        let cursors = wal.read().await?;

        let engine = Self {
            me: effects.signer.address(),
            wal,
            channels,
            pipelines,
            transport: effects.transport,
            signer: effects.signer,
            in_flight: Mutex::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
            completions: Mutex::new(HashMap::new()),
            settled: Mutex::new(VecDeque::new()),
        };

        {
            let mut in_flight = engine.in_flight.lock();
            for cursor in &cursors {
                in_flight.insert(cursor.log_key(), cursor.clone());
            }
        }
        info!(cursors = cursors.len(), "resuming in-flight executions");

        for cursor in cursors {
            let key = cursor.log_key();
            let lock = engine.key_lock(&key);
            let result = {
                let _guard = lock.lock().await;
                engine.resume(cursor).await
            };
            engine.release_key_lock(&key, lock);
            match result {
                Ok(outcome) => debug!(%key, ?outcome, "resumed"),
                Err(e) => warn!(%key, error = %e, "resume failed"),
            }
        }

        Ok(engine)
    }

    /// Address of the local participant
    pub fn me(&self) -> &Address {
        &self.me
    }

    /// Channel state store
    pub fn channels(&self) -> &ChannelStateStore {
        &self.channels
    }

    /// Cursors currently in flight
    pub fn in_flight(&self) -> Vec<ExecutionCursor> {
        let mut cursors: Vec<_> = self.in_flight.lock().values().cloned().collect();
        cursors.sort_by_key(ExecutionCursor::log_key);
        cursors
    }

    /// Number of log keys with a live dispatch lock
    pub fn locked_keys(&self) -> usize {
        self.key_locks.lock().len()
    }

    /// Number of requests with a live subscriber
    pub fn pending_subscriptions(&self) -> usize {
        let mut completions = self.completions.lock();
        sweep_closed(&mut completions);
        completions.len()
    }

    /// Receive the outcome of a protocol instance
    ///
    /// Resolves with the completion on commit or the error on abort.
    pub fn subscribe(
        &self,
        request_id: &RequestId,
    ) -> oneshot::Receiver<Result<Completion, ProtocolError>> {
        let (sender, receiver) = oneshot::channel();
        let mut completions = self.completions.lock();
        sweep_closed(&mut completions);
        completions
            .entry(request_id.clone())
            .or_default()
            .push(sender);
        receiver
    }

    /// Start a protocol instance as its initiator
    ///
    /// Repeating a request that is still in flight re-sends its journaled
    /// proposal instead of starting a second run.
    #[instrument(skip(self, message), fields(
        me = %self.me,
        protocol = %message.protocol_name(),
        request_id = %message.request_id,
    ))]
    pub async fn execute(
        &self,
        message: ClientActionMessage,
    ) -> Result<DispatchOutcome, ProtocolError> {
        let request_id = message.request_id.clone();
        let result = self.execute_checked(message).await;

        if let Err(e) = &result {
            // Resolve subscribers of a request that left nothing in flight
            let in_flight = self
                .in_flight
                .lock()
                .values()
                .any(|cursor| cursor.action.request_id == request_id);
            if !in_flight {
                self.notify(&request_id, Err(e.clone()));
            }
        }
        result
    }

    async fn execute_checked(
        &self,
        message: ClientActionMessage,
    ) -> Result<DispatchOutcome, ProtocolError> {
        message
            .validate()
            .map_err(|e| ProtocolError::Invalid(e.to_string()))?;
        if message.seq != 0 || message.from_address != self.me {
            return Err(ProtocolError::Invalid(
                "a local request must be an initiating message from this participant"
                    .to_string(),
            ));
        }

        let action = Action::new(message, false);
        let key = action.log_key();
        let lock = self.key_lock(&key);
        let result = {
            let _guard = lock.lock().await;
            self.execute_locked(&key, action).await
        };
        self.release_key_lock(&key, lock);
        result
    }

    async fn execute_locked(
        &self,
        key: &LogKey,
        action: Action,
    ) -> Result<DispatchOutcome, ProtocolError> {
        let existing = self.in_flight.lock().get(key).cloned();
        let Some(existing) = existing else {
            return self.drive(ExecutionCursor::new(action), None).await;
        };

        if existing.action.request_id != action.request_id {
            let err = ProtocolError::KeyCollision {
                key: key.to_string(),
                in_flight: existing.action.request_id.clone(),
                incoming: action.request_id.clone(),
            };
            warn!(error = %err, "rejected local request");
            return Err(err);
        }
        if existing.action.client_message != action.client_message {
            let err = ProtocolError::mismatch(key, "request id is in flight with another message");
            warn!(error = %err, "rejected local request");
            return Err(err);
        }

        self.resend(&existing).await?;
        Ok(DispatchOutcome::Suspended {
            key: key.clone(),
            awaiting: self.awaiting(&existing),
        })
    }

    /// Handle a message from the counterparty
    ///
    /// An initiating message starts a responder run; any other message must
    /// resume the in-flight cursor with the same log key. A redelivered
    /// proposal is answered with the reply already journaled or committed for
    /// it; a redelivered reply to a committed run changes nothing.
    #[instrument(skip(self, message), fields(
        me = %self.me,
        protocol = %message.protocol_name(),
        request_id = %message.request_id,
        seq = message.seq,
    ))]
    pub async fn receive(
        &self,
        message: ClientActionMessage,
    ) -> Result<DispatchOutcome, ProtocolError> {
        message
            .validate()
            .map_err(|e| ProtocolError::Invalid(e.to_string()))?;
        if message.to_address != self.me {
            return Err(ProtocolError::Invalid(format!(
                "message addressed to {}",
                message.to_address
            )));
        }

        let key = LogKey::for_message(&message);
        let lock = self.key_lock(&key);
        let result = {
            let _guard = lock.lock().await;
            self.receive_locked(&key, message).await
        };
        self.release_key_lock(&key, lock);

        if let Err(e) = &result {
            warn!(%key, error = %e, "message rejected");
        }
        result
    }

    async fn receive_locked(
        &self,
        key: &LogKey,
        message: ClientActionMessage,
    ) -> Result<DispatchOutcome, ProtocolError> {
        let existing = self.in_flight.lock().get(key).cloned();
        match existing {
            Some(cursor) if cursor.action.client_message == message => {
                debug!(%key, "proposal redelivered to an unfinished run");
                self.resume(cursor).await
            }
            Some(cursor) => {
                self.check_resumption(key, &cursor, &message)?;
                self.drive(cursor, Some(&message)).await
            }
            None => match self.settled(key, &message) {
                Some(settled) => {
                    debug!(%key, "message redelivered after commit");
                    if let Some(reply) = settled.reply {
                        self.send(reply).await?;
                    }
                    Ok(DispatchOutcome::Committed(Completion {
                        already_applied: true,
                        ..settled.completion
                    }))
                }
                None if message.seq == 0 => {
                    self.drive(ExecutionCursor::new(Action::new(message, true)), None)
                        .await
                }
                None => Err(ProtocolError::Unrecognized {
                    key: key.to_string(),
                }),
            },
        }
    }

    /// Abandon the cursor in flight under `key`
    ///
    /// Clears its log entry and resolves its subscribers with `Cancelled`.
    /// Returns `false` when nothing is in flight under the key.
    #[instrument(skip(self), fields(me = %self.me))]
    pub async fn abort(&self, key: &LogKey) -> Result<bool, ProtocolError> {
        let lock = self.key_lock(key);
        let result = {
            let _guard = lock.lock().await;
            let cursor = self.in_flight.lock().get(key).cloned();
            match cursor {
                Some(cursor) => {
                    let err = ProtocolError::Cancelled {
                        key: key.to_string(),
                    };
                    self.discard(&cursor, &err).await.map(|()| true)
                }
                None => Ok(false),
            }
        };
        self.release_key_lock(key, lock);
        result
    }

    fn key_lock(&self, key: &LogKey) -> KeyLock {
        self.key_locks
            .lock()
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Drop the key's lock once no other dispatch holds or awaits it
    fn release_key_lock(&self, key: &LogKey, lock: KeyLock) {
        let mut locks = self.key_locks.lock();
        // The map's reference and ours
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
    }

    fn check_resumption(
        &self,
        key: &LogKey,
        cursor: &ExecutionCursor,
        message: &ClientActionMessage,
    ) -> Result<(), ProtocolError> {
        let action = &cursor.action;
        if action.request_id != message.request_id {
            return Err(ProtocolError::KeyCollision {
                key: key.to_string(),
                in_flight: action.request_id.clone(),
                incoming: message.request_id.clone(),
            });
        }

        let pipeline = self.pipelines.get(action.protocol_name, action.side())?;
        let Some(step) = pipeline.step(cursor.instruction_pointer) else {
            return Err(ProtocolError::mismatch(key, "pipeline already complete"));
        };
        if step.awaits() != Some(message.seq) {
            return Err(ProtocolError::mismatch(
                key,
                format!("step {} does not await seq {}", step.name(), message.seq),
            ));
        }
        if message.payload != action.client_message.payload {
            return Err(ProtocolError::mismatch(key, "payload differs from proposal"));
        }
        if message.from_address != *action.counterparty() {
            return Err(ProtocolError::mismatch(
                key,
                format!("sent by {}", message.from_address),
            ));
        }
        Ok(())
    }

    fn awaiting(&self, cursor: &ExecutionCursor) -> Option<u32> {
        self.pipelines
            .get(cursor.action.protocol_name, cursor.action.side())
            .ok()
            .and_then(|pipeline| {
                pipeline
                    .step(cursor.instruction_pointer)
                    .and_then(|step| step.awaits())
            })
    }

    /// Re-send the cursor's journaled message, then continue it
    async fn resume(&self, cursor: ExecutionCursor) -> Result<DispatchOutcome, ProtocolError> {
        self.resend(&cursor).await?;
        self.drive(cursor, None).await
    }

    /// Hand the message journaled by the cursor's last step to the transport
    async fn resend(&self, cursor: &ExecutionCursor) -> Result<(), ProtocolError> {
        let Some(message) = cursor.results.last().and_then(StepResult::outgoing) else {
            return Ok(());
        };
        debug!(key = %cursor.log_key(), seq = message.seq, "re-sending journaled message");
        self.send(message.clone()).await
    }

    async fn send(&self, message: ClientActionMessage) -> Result<(), ProtocolError> {
        self.transport
            .send(message)
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))
    }

    /// Run the cursor's pipeline from its instruction pointer
    ///
    /// Callers hold the cursor's key lock.
    async fn drive(
        &self,
        mut cursor: ExecutionCursor,
        mut inbound: Option<&ClientActionMessage>,
    ) -> Result<DispatchOutcome, ProtocolError> {
        let key = cursor.log_key();
        let pipeline = self
            .pipelines
            .get(cursor.action.protocol_name, cursor.action.side())?;
        let snapshot = self
            .channels
            .snapshot(&cursor.action.client_message.multisig_address);

        while let Some(step) = pipeline.step(cursor.instruction_pointer) {
            let context = StepContext {
                action: &cursor.action,
                results: &cursor.results,
                snapshot: snapshot.as_ref(),
                inbound: if step.awaits().is_some() {
                    inbound.take()
                } else {
                    None
                },
                me: &self.me,
                signer: self.signer.as_ref(),
            };

            let outcome = match step.run(&context) {
                Ok(outcome) => outcome,
                Err(e) if e.preserves_cursor() => return Err(e),
                Err(e) => return self.fail(cursor, e).await,
            };

            match outcome {
                StepOutcome::Suspend => {
                    let tracked = self.in_flight.lock().contains_key(&key);
                    if !tracked {
                        self.wal.write(&cursor).await?;
                        self.in_flight.lock().insert(key.clone(), cursor);
                    }
                    debug!(%key, step = step.name(), "suspended");
                    return Ok(DispatchOutcome::Suspended {
                        key,
                        awaiting: step.awaits(),
                    });
                }
                StepOutcome::Continue(result) => {
                    let outgoing = result.outgoing().cloned();
                    let next = cursor.advanced(result);
                    self.wal.write(&next).await?;
                    self.in_flight.lock().insert(key.clone(), next.clone());
                    debug!(
                        %key,
                        step = step.name(),
                        ip = next.instruction_pointer,
                        "step completed"
                    );
                    cursor = next;

                    if let Some(message) = outgoing {
                        self.send(message).await?;
                    }
                }
            }
        }

        self.commit(cursor).await
    }

    async fn commit(&self, cursor: ExecutionCursor) -> Result<DispatchOutcome, ProtocolError> {
        let key = cursor.log_key();
        let Some(transition) = cursor.staged_transition().cloned() else {
            let err = ProtocolError::invalid_step("commit", "pipeline staged no transition");
            return self.fail(cursor, err).await;
        };

        let receipt = match self.channels.commit(&self.me, &transition).await {
            Ok(receipt) => receipt,
            Err(e) if e.is_invariant_violation() => return self.fail(cursor, e.into()).await,
            Err(e) => return Err(e.into()),
        };

        self.wal.clear(&cursor).await?;
        self.in_flight.lock().remove(&key);

        let completion = Completion {
            request_id: cursor.action.request_id.clone(),
            protocol_name: cursor.action.protocol_name,
            side: cursor.action.side(),
            multisig_address: receipt.multisig_address,
            app_id: receipt.app_id,
            already_applied: receipt.already_applied,
        };
        info!(
            %key,
            side = %completion.side,
            already_applied = completion.already_applied,
            "protocol committed"
        );
        self.remember(Settled {
            key,
            reply: cursor.results.last().and_then(StepResult::outgoing).cloned(),
            completion: completion.clone(),
        });
        self.notify(&completion.request_id, Ok(completion.clone()));
        Ok(DispatchOutcome::Committed(completion))
    }

    fn remember(&self, settled: Settled) {
        let mut runs = self.settled.lock();
        if runs.len() == SETTLED_CAPACITY {
            runs.pop_front();
        }
        runs.push_back(settled);
    }

    /// Committed run a redelivered message belongs to
    ///
    /// A proposal matches a responder run, any later message an initiator run.
    fn settled(&self, key: &LogKey, message: &ClientActionMessage) -> Option<Settled> {
        let side = if message.seq == 0 {
            Side::Responder
        } else {
            Side::Initiator
        };
        self.settled
            .lock()
            .iter()
            .find(|settled| {
                settled.key == *key
                    && settled.completion.request_id == message.request_id
                    && settled.completion.side == side
            })
            .cloned()
    }

    async fn fail(
        &self,
        cursor: ExecutionCursor,
        error: ProtocolError,
    ) -> Result<DispatchOutcome, ProtocolError> {
        self.discard(&cursor, &error).await?;
        Err(error)
    }

    /// Clear the cursor from the log and resolve its subscribers with `error`
    async fn discard(
        &self,
        cursor: &ExecutionCursor,
        error: &ProtocolError,
    ) -> Result<(), ProtocolError> {
        let key = cursor.log_key();
        warn!(%key, error = %error, "aborting execution");

        let tracked = self.in_flight.lock().contains_key(&key);
        if tracked {
            self.wal.clear(cursor).await?;
            self.in_flight.lock().remove(&key);
        }
        self.notify(&cursor.action.request_id, Err(error.clone()));
        Ok(())
    }

    fn notify(&self, request_id: &RequestId, outcome: Result<Completion, ProtocolError>) {
        let senders = self.completions.lock().remove(request_id).unwrap_or_default();
        for sender in senders {
            // Subscriber may have gone away
            let _ = sender.send(outcome.clone());
        }
    }
}

fn sweep_closed(completions: &mut HashMap<RequestId, Vec<CompletionSender>>) {
    completions.retain(|_, senders| {
        senders.retain(|sender| !sender.is_closed());
        !senders.is_empty()
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use tandem_core::{ProtocolPayload, TandemError};
    use tandem_effects::{Ed25519SigningHandler, MemoryStorageHandler};

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<ClientActionMessage>>,
        fail_next: Mutex<bool>,
    }

    impl RecordingTransport {
        fn take(&self) -> Vec<ClientActionMessage> {
            std::mem::take(&mut *self.sent.lock())
        }

        fn fail_next(&self) {
            *self.fail_next.lock() = true;
        }
    }

    #[async_trait]
    impl TransportEffects for RecordingTransport {
        async fn send(&self, message: ClientActionMessage) -> Result<(), TandemError> {
            if std::mem::take(&mut *self.fail_next.lock()) {
                return Err(TandemError::network("link down"));
            }
            self.sent.lock().push(message);
            Ok(())
        }
    }

    struct Peer {
        engine: ProtocolEngine,
        transport: Arc<RecordingTransport>,
        storage: MemoryStorageHandler,
    }

    async fn peer(seed: u8) -> Peer {
        let storage = MemoryStorageHandler::new();
        let transport = Arc::new(RecordingTransport::default());
        let effects = EngineEffects {
            storage: Arc::new(storage.clone()),
            transport: transport.clone(),
            signer: Arc::new(Ed25519SigningHandler::from_secret_bytes([seed; 32])),
        };
        let engine = ProtocolEngine::start(EngineConfig::default(), effects)
            .await
            .unwrap();
        Peer {
            engine,
            transport,
            storage,
        }
    }

    fn setup_message(from: &Peer, to: &Peer, request_id: &str) -> ClientActionMessage {
        ClientActionMessage::initiate(
            from.engine.me().clone(),
            to.engine.me().clone(),
            Address::new("0xmultisig"),
            None,
            RequestId::new(request_id),
            ProtocolPayload::Setup,
        )
    }

    #[tokio::test]
    async fn test_setup_exchange_commits_both_sides() {
        let alice = peer(1).await;
        let bob = peer(2).await;
        let mut done = alice.engine.subscribe(&RequestId::new("req-1"));

        let outcome = alice
            .engine
            .execute(setup_message(&alice, &bob, "req-1"))
            .await
            .unwrap();
        assert_matches!(outcome, DispatchOutcome::Suspended { awaiting: Some(1), .. });
        assert_eq!(alice.engine.in_flight().len(), 1);
        assert!(done.try_recv().is_err());

        let proposal = alice.transport.take().pop().unwrap();
        assert!(proposal.signature.is_some());
        let outcome = bob.engine.receive(proposal).await.unwrap();
        assert_matches!(outcome, DispatchOutcome::Committed(Completion { side: Side::Responder, .. }));

        let reply = bob.transport.take().pop().unwrap();
        alice.engine.receive(reply).await.unwrap();

        let completion = done.await.unwrap().unwrap();
        assert_eq!(completion.side, Side::Initiator);
        assert!(alice.engine.in_flight().is_empty());
        assert!(bob.engine.in_flight().is_empty());
        assert_eq!(
            alice.engine.channels().query_free_balance(&Address::new("0xmultisig")).unwrap(),
            bob.engine.channels().query_free_balance(&Address::new("0xmultisig")).unwrap()
        );
    }

    #[tokio::test]
    async fn test_reply_without_cursor_is_unrecognized() {
        let alice = peer(1).await;
        let bob = peer(2).await;
        let reply = setup_message(&alice, &bob, "req-1")
            .reply(tandem_core::Signature::from_bytes(vec![0; 64]));

        assert_matches!(
            alice.engine.receive(reply).await,
            Err(ProtocolError::Unrecognized { .. })
        );
    }

    #[tokio::test]
    async fn test_second_request_on_same_key_collides() {
        let alice = peer(1).await;
        let bob = peer(2).await;

        alice
            .engine
            .execute(setup_message(&alice, &bob, "req-1"))
            .await
            .unwrap();
        assert_matches!(
            alice.engine.execute(setup_message(&alice, &bob, "req-2")).await,
            Err(ProtocolError::KeyCollision { .. })
        );
    }

    #[tokio::test]
    async fn test_repeated_request_resends_proposal() {
        let alice = peer(1).await;
        let bob = peer(2).await;
        alice.transport.fail_next();

        assert_matches!(
            alice.engine.execute(setup_message(&alice, &bob, "req-1")).await,
            Err(ProtocolError::Transport(_))
        );
        assert!(alice.transport.take().is_empty());
        assert_eq!(alice.engine.in_flight().len(), 1);

        let outcome = alice
            .engine
            .execute(setup_message(&alice, &bob, "req-1"))
            .await
            .unwrap();
        assert_matches!(outcome, DispatchOutcome::Suspended { awaiting: Some(1), .. });
        let proposal = alice.transport.take().pop().unwrap();
        assert_eq!(proposal.seq, 0);
        assert!(proposal.signature.is_some());

        bob.engine.receive(proposal).await.unwrap();
        let reply = bob.transport.take().pop().unwrap();
        assert_matches!(
            alice.engine.receive(reply).await,
            Ok(DispatchOutcome::Committed(_))
        );
    }

    #[tokio::test]
    async fn test_redelivered_proposal_gets_journaled_reply() {
        let alice = peer(1).await;
        let bob = peer(2).await;
        alice
            .engine
            .execute(setup_message(&alice, &bob, "req-1"))
            .await
            .unwrap();
        let proposal = alice.transport.take().pop().unwrap();

        // Reply is journaled but never leaves
        bob.transport.fail_next();
        assert_matches!(
            bob.engine.receive(proposal.clone()).await,
            Err(ProtocolError::Transport(_))
        );
        assert_eq!(bob.engine.in_flight().len(), 1);
        assert!(bob.transport.take().is_empty());

        assert_matches!(
            bob.engine.receive(proposal.clone()).await,
            Ok(DispatchOutcome::Committed(Completion { already_applied: false, .. }))
        );
        let reply = bob.transport.take().pop().unwrap();
        assert!(bob.engine.in_flight().is_empty());

        // Once more after the commit: same reply, nothing applied twice
        assert_matches!(
            bob.engine.receive(proposal).await,
            Ok(DispatchOutcome::Committed(Completion { already_applied: true, .. }))
        );
        assert_eq!(bob.transport.take(), vec![reply.clone()]);

        alice.engine.receive(reply.clone()).await.unwrap();
        assert!(alice.engine.in_flight().is_empty());
        assert_matches!(
            alice.engine.receive(reply).await,
            Ok(DispatchOutcome::Committed(Completion { already_applied: true, side: Side::Initiator, .. }))
        );
    }

    #[tokio::test]
    async fn test_abort_frees_the_key() {
        let alice = peer(1).await;
        let bob = peer(2).await;
        let DispatchOutcome::Suspended { key, .. } = alice
            .engine
            .execute(setup_message(&alice, &bob, "req-1"))
            .await
            .unwrap()
        else {
            panic!("setup should wait for the counter-signature");
        };
        let done = alice.engine.subscribe(&RequestId::new("req-1"));

        assert!(alice.engine.abort(&key).await.unwrap());
        assert_matches!(done.await.unwrap(), Err(ProtocolError::Cancelled { .. }));
        assert!(alice.engine.in_flight().is_empty());
        let log = alice.storage.retrieve("tandem/wal").await.unwrap().unwrap();
        assert_eq!(log, b"{}".to_vec());
        assert!(!alice.engine.abort(&key).await.unwrap());

        assert_matches!(
            alice.engine.execute(setup_message(&alice, &bob, "req-2")).await,
            Ok(DispatchOutcome::Suspended { .. })
        );
    }

    #[tokio::test]
    async fn test_dispatch_bookkeeping_is_released() {
        let alice = peer(1).await;
        let bob = peer(2).await;

        let rejected = alice.engine.subscribe(&RequestId::new("req-0"));
        let mut bad = setup_message(&alice, &bob, "req-0");
        bad.seq = 1;
        assert!(alice.engine.execute(bad).await.is_err());
        assert_matches!(rejected.await.unwrap(), Err(ProtocolError::Invalid(_)));

        let abandoned = alice.engine.subscribe(&RequestId::new("req-1"));
        drop(abandoned);
        alice
            .engine
            .execute(setup_message(&alice, &bob, "req-1"))
            .await
            .unwrap();
        assert_eq!(alice.engine.locked_keys(), 0);
        assert_eq!(alice.engine.pending_subscriptions(), 0);

        let collided = alice.engine.subscribe(&RequestId::new("req-2"));
        assert!(alice
            .engine
            .execute(setup_message(&alice, &bob, "req-2"))
            .await
            .is_err());
        assert_matches!(collided.await.unwrap(), Err(ProtocolError::KeyCollision { .. }));
        assert_eq!(alice.engine.pending_subscriptions(), 0);
        assert_eq!(alice.engine.locked_keys(), 0);
    }

    #[tokio::test]
    async fn test_suspended_cursor_survives_restart() {
        let alice = peer(1).await;
        let bob = peer(2).await;
        alice
            .engine
            .execute(setup_message(&alice, &bob, "req-1"))
            .await
            .unwrap();
        let proposal = alice.transport.take().pop().unwrap();

        let restarted = ProtocolEngine::start(
            EngineConfig::default(),
            EngineEffects {
                storage: Arc::new(alice.storage.clone()),
                transport: alice.transport.clone(),
                signer: Arc::new(Ed25519SigningHandler::from_secret_bytes([1; 32])),
            },
        )
        .await
        .unwrap();
        drop(alice);
        assert_eq!(restarted.in_flight().len(), 1);
        assert_eq!(restarted.in_flight()[0].instruction_pointer, 4);

        bob.engine.receive(proposal).await.unwrap();
        let reply = bob.transport.take().pop().unwrap();
        assert_matches!(
            restarted.receive(reply).await,
            Ok(DispatchOutcome::Committed(_))
        );
        assert!(restarted.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_channel_aborts_without_logging() {
        let alice = peer(1).await;
        let bob = peer(2).await;
        let mut update = setup_message(&alice, &bob, "req-1");
        update.app_id = Some(AppId::new("0xapp"));
        update.payload = ProtocolPayload::Update(tandem_core::UpdateParams {
            state: tandem_core::AppState::new(serde_json::json!({})),
        });
        let done = alice.engine.subscribe(&RequestId::new("req-1"));

        assert_matches!(
            alice.engine.execute(update).await,
            Err(ProtocolError::State(tandem_state::StateError::UnknownChannel { .. }))
        );
        assert_matches!(done.await.unwrap(), Err(ProtocolError::State(_)));
        assert!(alice.storage.retrieve("tandem/wal").await.unwrap().is_none());
    }
}
