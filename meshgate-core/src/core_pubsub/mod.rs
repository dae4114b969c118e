/*
    Broadcast channel - topic-scoped, unordered, unreliable delivery

    The protocols only assume fire-and-forget publish, per-topic subscription,
    a count of remote subscribers and the local identity. Delivery may drop,
    duplicate or reorder messages; none of the core logic depends on it doing
    otherwise.

    `BroadcastHub` is the in-process mesh: each peer gets a `HubEndpoint`
    from the hub, and a peer can be partitioned away to simulate losing
    connectivity.
*/

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Buffered messages per subscription before new ones are dropped
pub const SUBSCRIPTION_CAPACITY: usize = 256;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("No peers subscribed to topic {0}")]
    InsufficientPeers(String),

    #[error("Not subscribed to topic {0}")]
    NotSubscribed(String),

    #[error("Broadcast channel error: {0}")]
    Internal(String),
}

fn handle_poison<T>(_err: PoisonError<T>) -> BroadcastError {
    BroadcastError::Internal("Lock poisoned: a thread panicked while holding the lock".to_string())
}

/// A message received on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    /// Identity of the publishing peer
    pub from: String,
    pub data: Vec<u8>,
}

/// Receiving side of one topic subscription
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    rx: mpsc::Receiver<InboundMessage>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, rx: mpsc::Receiver<InboundMessage>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message, or `None` once the subscription is closed
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<InboundMessage> {
        self.rx.try_recv().ok()
    }
}

#[async_trait]
pub trait BroadcastChannel: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BroadcastError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), BroadcastError>;

    /// Best-effort delivery to every current subscriber of `topic`
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), BroadcastError>;

    /// Remote peers currently reachable on `topic`
    async fn subscriber_count(&self, topic: &str) -> usize;

    fn local_identity(&self) -> &str;
}

#[derive(Default)]
struct HubState {
    topics: HashMap<String, HashMap<String, mpsc::Sender<InboundMessage>>>,
    partitioned: HashSet<String>,
}

impl HubState {
    fn reachable(&self, a: &str, b: &str) -> bool {
        !self.partitioned.contains(a) && !self.partitioned.contains(b)
    }
}

/// In-process mesh shared by all simulated peers
#[derive(Clone, Default)]
pub struct BroadcastHub {
    state: Arc<Mutex<HubState>>,
    emit_self: bool,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also deliver a peer's own messages back to it
    pub fn with_emit_self(mut self, emit_self: bool) -> Self {
        self.emit_self = emit_self;
        self
    }

    /// Channel handle for the peer `identity`
    pub fn endpoint(&self, identity: impl Into<String>) -> HubEndpoint {
        HubEndpoint {
            hub: self.clone(),
            identity: identity.into(),
        }
    }

    /// Cut `identity` off from every other peer, or restore it
    pub fn set_partitioned(&self, identity: &str, partitioned: bool) {
        if let Ok(mut state) = self.state.lock() {
            if partitioned {
                state.partitioned.insert(identity.to_string());
            } else {
                state.partitioned.remove(identity);
            }
            debug!(peer = identity, partitioned, "Partition changed");
        }
    }

    /// Identities subscribed to `topic`, sorted
    pub fn subscribers(&self, topic: &str) -> Vec<String> {
        let Ok(state) = self.state.lock() else {
            return Vec::new();
        };
        let mut peers: Vec<String> = state
            .topics
            .get(topic)
            .map(|subs| {
                subs.iter()
                    .filter(|(_, tx)| !tx.is_closed())
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default();
        peers.sort();
        peers
    }
}

/// One peer's view of a `BroadcastHub`
#[derive(Clone)]
pub struct HubEndpoint {
    hub: BroadcastHub,
    identity: String,
}

#[async_trait]
impl BroadcastChannel for HubEndpoint {
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BroadcastError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let mut state = self.hub.state.lock().map_err(handle_poison)?;
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(self.identity.clone(), tx);
        debug!(peer = %self.identity, topic, "Subscribed");
        Ok(Subscription::new(topic, rx))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BroadcastError> {
        let mut state = self.hub.state.lock().map_err(handle_poison)?;
        let removed = state
            .topics
            .get_mut(topic)
            .and_then(|subs| subs.remove(&self.identity));
        match removed {
            Some(_) => {
                debug!(peer = %self.identity, topic, "Unsubscribed");
                Ok(())
            }
            None => Err(BroadcastError::NotSubscribed(topic.to_string())),
        }
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), BroadcastError> {
        let mut state = self.hub.state.lock().map_err(handle_poison)?;

        let mut targets = Vec::new();
        if let Some(subs) = state.topics.get(topic) {
            for (peer, tx) in subs {
                let is_self = *peer == self.identity;
                if is_self && !self.hub.emit_self {
                    continue;
                }
                if !is_self && !state.reachable(&self.identity, peer) {
                    continue;
                }
                targets.push((peer.clone(), tx.clone()));
            }
        }

        let remote = targets.iter().any(|(peer, _)| *peer != self.identity);
        if !remote {
            return Err(BroadcastError::InsufficientPeers(topic.to_string()));
        }

        let mut closed = Vec::new();
        for (peer, tx) in targets {
            let message = InboundMessage {
                topic: topic.to_string(),
                from: self.identity.clone(),
                data: data.clone(),
            };
            match tx.try_send(message) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!(peer = %peer, topic, "Subscriber queue full, message dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(peer),
            }
        }

        if !closed.is_empty() {
            if let Some(subs) = state.topics.get_mut(topic) {
                for peer in closed {
                    subs.remove(&peer);
                }
            }
        }
        Ok(())
    }

    async fn subscriber_count(&self, topic: &str) -> usize {
        let Ok(state) = self.hub.state.lock() else {
            return 0;
        };
        state
            .topics
            .get(topic)
            .map(|subs| {
                subs.iter()
                    .filter(|(peer, tx)| {
                        **peer != self.identity && !tx.is_closed() && state.reachable(&self.identity, peer)
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    fn local_identity(&self) -> &str {
        &self.identity
    }
}
