//! Two engines wired through a `MemoryNetwork`
//!
//! Each party owns a store that outlives its engine. `crash` drops the
//! engine from the network; `restart` starts a fresh engine over the same
//! store, which reads the log back and resumes whatever was in flight.

use std::sync::Arc;
use tandem_core::{Address, EngineConfig, StorageEffects};
use tandem_effects::MemoryStorageHandler;
use tandem_protocol::{ChannelClient, EngineEffects, ProtocolEngine, ProtocolError};
use tandem_state::ChannelState;

use crate::fixtures::{multisig, signer, ALICE_SEED, BOB_SEED};
use crate::network::{Delivery, MemoryNetwork};
use crate::storage::FaultyStorage;

/// One of the two harness participants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    /// Participant keyed by `ALICE_SEED`
    Alice,
    /// Participant keyed by `BOB_SEED`
    Bob,
}

impl Party {
    /// The other participant
    pub fn other(self) -> Self {
        match self {
            Party::Alice => Party::Bob,
            Party::Bob => Party::Alice,
        }
    }

    fn seed(self) -> [u8; 32] {
        match self {
            Party::Alice => ALICE_SEED,
            Party::Bob => BOB_SEED,
        }
    }
}

struct Slot {
    storage: Arc<FaultyStorage>,
    engine: Option<Arc<ProtocolEngine>>,
}

/// Two peers, their stores and the network between them
pub struct TwoPartyHarness {
    config: EngineConfig,
    network: Arc<MemoryNetwork>,
    alice: Slot,
    bob: Slot,
}

impl TwoPartyHarness {
    /// Both peers on fresh in-memory stores with the default configuration
    pub async fn in_memory() -> Result<Self, ProtocolError> {
        Self::with_config(EngineConfig::default()).await
    }

    /// Both peers on fresh in-memory stores
    pub async fn with_config(config: EngineConfig) -> Result<Self, ProtocolError> {
        Self::new(
            config,
            Arc::new(MemoryStorageHandler::new()),
            Arc::new(MemoryStorageHandler::new()),
        )
        .await
    }

    /// Both peers on the given stores
    pub async fn new(
        config: EngineConfig,
        alice_store: Arc<dyn StorageEffects>,
        bob_store: Arc<dyn StorageEffects>,
    ) -> Result<Self, ProtocolError> {
        let slot = |store| Slot {
            storage: Arc::new(FaultyStorage::new(store, config.wal.namespace.clone())),
            engine: None,
        };
        let mut harness = Self {
            network: MemoryNetwork::new(),
            alice: slot(alice_store),
            bob: slot(bob_store),
            config,
        };
        harness.restart(Party::Alice).await?;
        harness.restart(Party::Bob).await?;
        Ok(harness)
    }

    fn slot(&self, party: Party) -> &Slot {
        match party {
            Party::Alice => &self.alice,
            Party::Bob => &self.bob,
        }
    }

    fn slot_mut(&mut self, party: Party) -> &mut Slot {
        match party {
            Party::Alice => &mut self.alice,
            Party::Bob => &mut self.bob,
        }
    }

    /// The shared network
    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }

    /// Address of a participant
    pub fn address(&self, party: Party) -> Address {
        crate::fixtures::address(party.seed())
    }

    /// Store of a participant, with its fault controls
    pub fn storage(&self, party: Party) -> &Arc<FaultyStorage> {
        &self.slot(party).storage
    }

    /// Running engine of a participant
    ///
    /// Panics if the participant is crashed.
    pub fn engine(&self, party: Party) -> Arc<ProtocolEngine> {
        self.slot(party)
            .engine
            .clone()
            .expect("participant is crashed")
    }

    /// Client facade over a participant's engine
    pub fn client(&self, party: Party) -> ChannelClient {
        ChannelClient::new(self.engine(party))
    }

    /// A participant's view of the scenario channel
    pub fn channel_state(&self, party: Party) -> Result<ChannelState, ProtocolError> {
        Ok(self
            .engine(party)
            .channels()
            .query_state_channel(&multisig())?)
    }

    /// Drop a participant's engine; its queued messages wait
    pub fn crash(&mut self, party: Party) {
        let address = self.address(party);
        self.network.detach(&address);
        self.slot_mut(party).engine = None;
    }

    /// Start a fresh engine for a participant over its surviving store
    pub async fn restart(&mut self, party: Party) -> Result<Arc<ProtocolEngine>, ProtocolError> {
        self.crash(party);
        let effects = EngineEffects {
            storage: self.slot(party).storage.clone(),
            transport: self.network.transport(),
            signer: Arc::new(signer(party.seed())),
        };
        let engine = Arc::new(ProtocolEngine::start(self.config.clone(), effects).await?);
        self.network.attach(engine.clone());
        self.slot_mut(party).engine = Some(engine.clone());
        Ok(engine)
    }

    /// Deliver everything deliverable
    pub async fn deliver_all(&self) -> Vec<Delivery> {
        self.network.deliver_all().await
    }
}
