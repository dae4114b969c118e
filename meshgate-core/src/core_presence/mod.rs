/*
    Presence - heartbeat-driven liveness

    PresenceService owns a PresenceTracker and drives it from three sources:
    the heartbeat ticker, the prune ticker and inbound presence-topic
    messages. Consumers never touch the tracker; they hold a PresenceHandle
    with a watch on the online list, a stream of PresenceEvents and a way to
    send chat on the same topic.

    Heartbeats are fire-and-forget. A failed publish is logged and the next
    tick tries again. Reach-hint dials run in their own tasks, at most one
    per peer, so a slow dial never holds up the loop.
*/

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

mod dialer;
mod message;
mod tracker;

pub use dialer::{DialError, NoDialer, PeerDialer, RecordingDialer};
pub use message::{ChatMessage, Heartbeat, PresenceMessage};
pub use tracker::{DropReason, HeartbeatOutcome, PeerRecord, PresenceTracker};

use crate::clock::Clock;
use crate::config::PresenceConfig;
use crate::core_identity::NodeIdentity;
use crate::core_pubsub::{BroadcastChannel, BroadcastError, InboundMessage};
use crate::metrics;
use crate::shutdown::ShutdownListener;

const EVENT_CAPACITY: usize = 64;
const CHAT_CAPACITY: usize = 32;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PresenceError {
    #[error("Malformed presence payload: {0}")]
    Malformed(String),

    #[error("Failed to encode presence payload: {0}")]
    Encode(String),

    #[error("Presence service stopped")]
    Stopped,

    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    PeerOnline(PeerRecord),
    PeerOffline(PeerRecord),
    Chat { from: String, name: String, text: String },
}

/// Consumer side of a running PresenceService
#[derive(Clone)]
pub struct PresenceHandle {
    peers_rx: watch::Receiver<Vec<PeerRecord>>,
    event_tx: broadcast::Sender<PresenceEvent>,
    chat_tx: mpsc::Sender<String>,
}

impl PresenceHandle {
    /// Snapshot of the online list, sorted by display name
    pub fn online_peers(&self) -> Vec<PeerRecord> {
        self.peers_rx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<PeerRecord>> {
        self.peers_rx.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<PresenceEvent> {
        self.event_tx.subscribe()
    }

    /// Queue a chat line for broadcast under our display name
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<(), PresenceError> {
        self.chat_tx
            .send(text.into())
            .await
            .map_err(|_| PresenceError::Stopped)
    }
}

pub struct PresenceService {
    tracker: PresenceTracker,
    topic: String,
    heartbeat_interval: Duration,
    prune_interval: Duration,
    channel: Arc<dyn BroadcastChannel>,
    dialer: Arc<dyn PeerDialer>,
    clock: Arc<dyn Clock>,
    peers_tx: watch::Sender<Vec<PeerRecord>>,
    event_tx: broadcast::Sender<PresenceEvent>,
    chat_rx: mpsc::Receiver<String>,
    dials: JoinSet<String>,
    dialing: HashSet<String>,
}

impl PresenceService {
    pub fn new(
        local: NodeIdentity,
        config: &PresenceConfig,
        channel: Arc<dyn BroadcastChannel>,
        dialer: Arc<dyn PeerDialer>,
        clock: Arc<dyn Clock>,
    ) -> (Self, PresenceHandle) {
        let (peers_tx, peers_rx) = watch::channel(Vec::new());
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (chat_tx, chat_rx) = mpsc::channel(CHAT_CAPACITY);

        let tracker = PresenceTracker::new(local, config.offline_timeout)
            .with_reach_address(config.reach_address.clone());

        let service = Self {
            tracker,
            topic: config.topic.clone(),
            heartbeat_interval: config.heartbeat_interval,
            prune_interval: config.prune_interval,
            channel,
            dialer,
            clock,
            peers_tx,
            event_tx: event_tx.clone(),
            chat_rx,
            dials: JoinSet::new(),
            dialing: HashSet::new(),
        };
        let handle = PresenceHandle {
            peers_rx,
            event_tx,
            chat_tx,
        };
        (service, handle)
    }

    /// Run until shutdown. Only a failed subscribe ends the loop early.
    pub async fn run(mut self, mut shutdown: ShutdownListener) -> Result<(), PresenceError> {
        let mut subscription = self.channel.subscribe(&self.topic).await?;
        info!(
            peer = ?self.tracker.local(),
            topic = %self.topic,
            "Presence started"
        );

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut prune = tokio::time::interval(self.prune_interval);
        prune.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                message = subscription.recv() => match message {
                    Some(message) => self.on_message(message).await,
                    None => {
                        warn!(topic = %self.topic, "Presence subscription closed");
                        break;
                    }
                },
                _ = heartbeat.tick() => self.on_tick().await,
                _ = prune.tick() => self.on_prune_tick(),
                Some(text) = self.chat_rx.recv() => self.send_chat(text).await,
                Some(dialed) = self.dials.join_next() => match dialed {
                    Ok(peer) => {
                        self.dialing.remove(&peer);
                    }
                    Err(e) => debug!(error = %e, "Dial task failed"),
                },
            }
        }

        self.dials.shutdown().await;
        if let Err(e) = self.channel.unsubscribe(&self.topic).await {
            debug!(error = %e, "Presence unsubscribe failed");
        }
        info!(peer = ?self.tracker.local(), "Presence stopped");
        Ok(())
    }

    async fn on_tick(&self) {
        let beat = PresenceMessage::Heartbeat(self.tracker.heartbeat(self.clock.unix_millis()));
        let result = match beat.encode() {
            Ok(bytes) => self.channel.publish(&self.topic, bytes).await.map_err(PresenceError::from),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                metrics::heartbeat_sent(true);
                trace!("Heartbeat sent");
            }
            Err(e) => {
                metrics::heartbeat_sent(false);
                debug!(error = %e, "Heartbeat not delivered");
            }
        }
    }

    async fn on_message(&mut self, message: InboundMessage) {
        if message.from == self.tracker.local().identity() {
            metrics::presence_message_dropped(DropReason::OwnMessage.as_str());
            return;
        }
        let payload = match PresenceMessage::decode(&message.data) {
            Ok(payload) => payload,
            Err(e) => {
                metrics::presence_message_dropped("malformed");
                trace!(from = %message.from, error = %e, "Dropping presence payload");
                return;
            }
        };

        match payload {
            PresenceMessage::Heartbeat(beat) => self.on_heartbeat(&message.from, beat).await,
            PresenceMessage::Chat(chat) => {
                debug!(from = %message.from, name = %chat.name, "Chat received");
                let _ = self.event_tx.send(PresenceEvent::Chat {
                    from: message.from,
                    name: chat.name,
                    text: chat.text,
                });
            }
        }
    }

    async fn on_heartbeat(&mut self, from: &str, beat: Heartbeat) {
        let now = self.clock.now();
        match self.tracker.on_heartbeat(from, &beat, now) {
            HeartbeatOutcome::Ignored(reason) => {
                metrics::presence_message_dropped(reason.as_str());
                trace!(from, reason = reason.as_str(), "Heartbeat ignored");
                return;
            }
            HeartbeatOutcome::Joined => {
                metrics::heartbeat_received();
                if let Some(record) = self.tracker.get(from).cloned() {
                    info!(peer = %record.display_name, identity = from, "Peer online");
                    let _ = self.event_tx.send(PresenceEvent::PeerOnline(record));
                }
                self.publish_snapshot();
            }
            HeartbeatOutcome::Refreshed => {
                metrics::heartbeat_received();
                self.publish_snapshot();
            }
        }

        if let Some(address) = beat.reach_address {
            self.spawn_dial(from, address);
        }
    }

    fn spawn_dial(&mut self, from: &str, address: String) {
        if !self.dialing.insert(from.to_string()) {
            return;
        }
        let dialer = self.dialer.clone();
        let peer = from.to_string();
        self.dials.spawn(async move {
            if !dialer.is_connected(&peer).await {
                match dialer.dial(&address).await {
                    Ok(()) => debug!(peer = %peer, address = %address, "Dialed peer from reach hint"),
                    Err(e) => trace!(peer = %peer, error = %e, "Reach hint dial failed"),
                }
            }
            peer
        });
    }

    fn on_prune_tick(&mut self) {
        let removed = self.tracker.prune(self.clock.now());
        if removed.is_empty() {
            return;
        }
        for record in removed {
            info!(peer = %record.display_name, identity = %record.identity, "Peer offline");
            let _ = self.event_tx.send(PresenceEvent::PeerOffline(record));
        }
        self.publish_snapshot();
    }

    async fn send_chat(&self, text: String) {
        let chat = PresenceMessage::Chat(ChatMessage {
            name: self.tracker.local().display_name().to_string(),
            text,
        });
        let result = match chat.encode() {
            Ok(bytes) => self.channel.publish(&self.topic, bytes).await.map_err(PresenceError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(error = %e, "Chat message not delivered");
        }
    }

    fn publish_snapshot(&self) {
        let peers = self.tracker.online_peers();
        metrics::set_peers_online(peers.len());
        self.peers_tx.send_replace(peers);
    }
}
