//! In-memory network between engines
//!
//! Sent messages land in one FIFO queue. Nothing moves until `deliver_all`
//! is called or a router task is running, so a test decides exactly when a
//! peer sees its counterparty's messages. Messages for a detached (crashed)
//! peer stay queued until it is attached again. A peer's sends can be made
//! to fail, which drops the message and reports a network error.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tandem_core::{Address, ClientActionMessage, TandemError, TransportEffects};
use tandem_protocol::{DispatchOutcome, ProtocolEngine, ProtocolError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One delivered message and what the recipient made of it
#[derive(Debug)]
pub struct Delivery {
    /// The message
    pub message: ClientActionMessage,
    /// The recipient's dispatch result
    pub outcome: Result<DispatchOutcome, ProtocolError>,
}

/// Shared message queue and routing table
#[derive(Default)]
pub struct MemoryNetwork {
    queue: Mutex<VecDeque<ClientActionMessage>>,
    engines: Mutex<HashMap<Address, Arc<ProtocolEngine>>>,
    failing_sends: Mutex<HashMap<Address, usize>>,
    wake: Notify,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport that sends into this network
    pub fn transport(self: &Arc<Self>) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            network: self.clone(),
        })
    }

    /// Route messages for the engine's address to it
    pub fn attach(&self, engine: Arc<ProtocolEngine>) {
        self.engines.lock().insert(engine.me().clone(), engine);
        self.wake.notify_one();
    }

    /// Stop routing to `address`; its messages stay queued
    pub fn detach(&self, address: &Address) -> Option<Arc<ProtocolEngine>> {
        self.engines.lock().remove(address)
    }

    /// Put a message on the queue
    pub fn inject(&self, message: ClientActionMessage) {
        self.queue.lock().push_back(message);
        self.wake.notify_one();
    }

    /// Fail the next `count` sends from `sender`
    pub fn fail_sends(&self, sender: &Address, count: usize) {
        self.failing_sends.lock().insert(sender.clone(), count);
    }

    fn take_send_failure(&self, sender: &Address) -> bool {
        let mut failing = self.failing_sends.lock();
        match failing.get_mut(sender) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    /// Number of queued messages
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Remove and return every queued message
    pub fn drain(&self) -> Vec<ClientActionMessage> {
        self.queue.lock().drain(..).collect()
    }

    fn next_deliverable(&self) -> Option<(ClientActionMessage, Arc<ProtocolEngine>)> {
        let engines = self.engines.lock();
        let mut queue = self.queue.lock();
        let position = queue
            .iter()
            .position(|message| engines.contains_key(&message.to_address))?;
        let message = queue.remove(position)?;
        let engine = engines.get(&message.to_address)?.clone();
        Some((message, engine))
    }

    /// Deliver queued messages, including ones sent while delivering, until
    /// none is left for an attached engine
    pub async fn deliver_all(&self) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        while let Some((message, engine)) = self.next_deliverable() {
            debug!(
                to = %message.to_address,
                request_id = %message.request_id,
                seq = message.seq,
                "delivering"
            );
            let outcome = engine.receive(message.clone()).await;
            deliveries.push(Delivery { message, outcome });
        }
        deliveries
    }

    /// Deliver in the background as messages arrive
    pub fn spawn_router(self: &Arc<Self>) -> JoinHandle<()> {
        let network = self.clone();
        tokio::spawn(async move {
            loop {
                for delivery in network.deliver_all().await {
                    if let Err(e) = &delivery.outcome {
                        warn!(
                            request_id = %delivery.message.request_id,
                            error = %e,
                            "delivery rejected"
                        );
                    }
                }
                network.wake.notified().await;
            }
        })
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("pending", &self.pending())
            .field("attached", &self.engines.lock().len())
            .finish()
    }
}

/// Transport handle for one engine
#[derive(Debug)]
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl TransportEffects for MemoryTransport {
    async fn send(&self, message: ClientActionMessage) -> Result<(), TandemError> {
        if self.network.take_send_failure(&message.from_address) {
            debug!(from = %message.from_address, seq = message.seq, "send dropped");
            return Err(TandemError::network(format!(
                "link from {} is down",
                message.from_address
            )));
        }
        self.network.inject(message);
        Ok(())
    }
}
