/*
    PresenceTracker - who is online, from heartbeats alone

    Pure state: the service feeds it heartbeats and prune ticks with the
    current instant and it answers membership queries. Peers are keyed by the
    transport identity of the sender, never by the name they claim.

    A heartbeat only counts if its timestamp is newer than the last one
    accepted from that peer, so duplicated or reordered deliveries cannot
    refresh a peer, and `last_seen_at` never moves backwards.
*/

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::message::Heartbeat;
use crate::core_identity::NodeIdentity;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub identity: String,
    pub display_name: String,
    pub last_seen_at: Instant,
    /// Sender timestamp of the last accepted heartbeat
    pub last_heartbeat_ms: u64,
    pub reach_address: Option<String>,
}

/// Why a heartbeat was not applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    OwnMessage,
    Stale,
    IdentityMismatch,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::OwnMessage => "self",
            DropReason::Stale => "stale",
            DropReason::IdentityMismatch => "mismatch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// First heartbeat from this peer since it was last pruned
    Joined,
    Refreshed,
    Ignored(DropReason),
}

pub struct PresenceTracker {
    local: NodeIdentity,
    reach_address: Option<String>,
    offline_timeout: Duration,
    peers: HashMap<String, PeerRecord>,
}

impl PresenceTracker {
    pub fn new(local: NodeIdentity, offline_timeout: Duration) -> Self {
        Self {
            local,
            reach_address: None,
            offline_timeout,
            peers: HashMap::new(),
        }
    }

    pub fn with_reach_address(mut self, address: Option<String>) -> Self {
        self.reach_address = address;
        self
    }

    pub fn local(&self) -> &NodeIdentity {
        &self.local
    }

    /// Heartbeat to broadcast this tick
    pub fn heartbeat(&self, timestamp_ms: u64) -> Heartbeat {
        Heartbeat {
            identity: self.local.identity().to_string(),
            display_name: self.local.display_name().to_string(),
            timestamp: timestamp_ms,
            reach_address: self.reach_address.clone(),
        }
    }

    /// Apply a heartbeat received from transport identity `from` at `now`
    pub fn on_heartbeat(&mut self, from: &str, heartbeat: &Heartbeat, now: Instant) -> HeartbeatOutcome {
        if from == self.local.identity() {
            return HeartbeatOutcome::Ignored(DropReason::OwnMessage);
        }
        if heartbeat.identity != from {
            return HeartbeatOutcome::Ignored(DropReason::IdentityMismatch);
        }

        match self.peers.get_mut(from) {
            Some(record) => {
                if heartbeat.timestamp <= record.last_heartbeat_ms {
                    return HeartbeatOutcome::Ignored(DropReason::Stale);
                }
                record.display_name = heartbeat.display_name.clone();
                record.last_seen_at = record.last_seen_at.max(now);
                record.last_heartbeat_ms = heartbeat.timestamp;
                record.reach_address = heartbeat.reach_address.clone();
                HeartbeatOutcome::Refreshed
            }
            None => {
                self.peers.insert(
                    from.to_string(),
                    PeerRecord {
                        identity: from.to_string(),
                        display_name: heartbeat.display_name.clone(),
                        last_seen_at: now,
                        last_heartbeat_ms: heartbeat.timestamp,
                        reach_address: heartbeat.reach_address.clone(),
                    },
                );
                HeartbeatOutcome::Joined
            }
        }
    }

    /// Drop peers silent for longer than the offline timeout; returns them
    pub fn prune(&mut self, now: Instant) -> Vec<PeerRecord> {
        let timeout = self.offline_timeout;
        let expired: Vec<String> = self
            .peers
            .values()
            .filter(|p| now.saturating_duration_since(p.last_seen_at) > timeout)
            .map(|p| p.identity.clone())
            .collect();

        let mut removed: Vec<PeerRecord> = expired
            .iter()
            .filter_map(|id| self.peers.remove(id))
            .collect();
        removed.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        removed
    }

    /// Online peers sorted by display name, then identity
    pub fn online_peers(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.identity.cmp(&b.identity))
        });
        peers
    }

    pub fn get(&self, identity: &str) -> Option<&PeerRecord> {
        self.peers.get(identity)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
