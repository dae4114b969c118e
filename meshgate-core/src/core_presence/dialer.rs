//! Opportunistic direct connections from heartbeat reach hints

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Dial {address} failed: {reason}")]
pub struct DialError {
    pub address: String,
    pub reason: String,
}

#[async_trait]
pub trait PeerDialer: Send + Sync {
    /// Whether a direct connection to `identity` already exists
    async fn is_connected(&self, identity: &str) -> bool;

    async fn dial(&self, address: &str) -> Result<(), DialError>;
}

/// Hosts without a dialer: every peer counts as connected
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDialer;

#[async_trait]
impl PeerDialer for NoDialer {
    async fn is_connected(&self, _identity: &str) -> bool {
        true
    }

    async fn dial(&self, _address: &str) -> Result<(), DialError> {
        Ok(())
    }
}

/// Records dial attempts; connected peers are set by hand
#[derive(Debug, Clone, Default)]
pub struct RecordingDialer {
    connected: Arc<Mutex<HashSet<String>>>,
    dials: Arc<Mutex<Vec<String>>>,
    refuse: bool,
    latency: Duration,
}

impl RecordingDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every dial fails
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    /// Each dial takes `latency` before it resolves
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn mark_connected(&self, identity: &str) {
        if let Ok(mut connected) = self.connected.lock() {
            connected.insert(identity.to_string());
        }
    }

    pub fn dials(&self) -> Vec<String> {
        self.dials.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PeerDialer for RecordingDialer {
    async fn is_connected(&self, identity: &str) -> bool {
        self.connected
            .lock()
            .map(|c| c.contains(identity))
            .unwrap_or(false)
    }

    async fn dial(&self, address: &str) -> Result<(), DialError> {
        if let Ok(mut dials) = self.dials.lock() {
            dials.push(address.to_string());
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.refuse {
            return Err(DialError {
                address: address.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}
