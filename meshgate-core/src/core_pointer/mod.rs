/*
    Named pointer store - mutable, signed name record

    One logical record per key, holding a content reference and a sequence
    number. Writes require the private credential for the key and always land
    at `current + 1`; the store, not the writer, picks the sequence, so two
    concurrent writers are ordered by arrival and the later one wins.

    Reads return the highest-sequence record. A key nobody has written yet is
    `NotFound`, which is a different answer from `Unreachable`: callers must
    not read an outage as an empty registry.

    Callers bound both operations with `tokio::time::timeout`.
*/

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

mod record;

pub use record::{PointerKey, PointerRecord};

use crate::core_content::ContentRef;
use crate::core_identity::RegistryCredential;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PointerError {
    #[error("No record published for {0}")]
    NotFound(PointerKey),

    #[error("Pointer store unreachable: {0}")]
    Unreachable(String),

    #[error("Pointer operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Credential does not own pointer {0}")]
    Unauthorized(PointerKey),

    #[error("Invalid pointer record: {0}")]
    InvalidRecord(String),

    #[error("Pointer store error: {0}")]
    Internal(String),
}

impl PointerError {
    /// Failures a later attempt may not repeat
    pub fn is_transient(&self) -> bool {
        matches!(self, PointerError::Unreachable(_) | PointerError::Timeout(_))
    }
}

fn handle_poison<T>(_err: PoisonError<T>) -> PointerError {
    PointerError::Internal("Lock poisoned: a thread panicked while holding the lock".to_string())
}

#[async_trait]
pub trait NamedPointerStore: Send + Sync {
    /// Highest-sequence record for `key`
    async fn resolve(&self, key: &PointerKey) -> Result<PointerRecord, PointerError>;

    /// Point `key` at `content_ref`; returns the sequence assigned to the write
    async fn publish(
        &self,
        key: &PointerKey,
        content_ref: ContentRef,
        credential: &RegistryCredential,
    ) -> Result<u64, PointerError>;
}

/// One accepted write, kept for inspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishEntry {
    pub key: PointerKey,
    pub content_ref: ContentRef,
    pub sequence: u64,
    pub at: Instant,
}

/// Single-replica in-memory store with outage and latency injection
#[derive(Clone, Default)]
pub struct MemoryPointerStore {
    records: Arc<Mutex<HashMap<PointerKey, PointerRecord>>>,
    history: Arc<Mutex<Vec<PublishEntry>>>,
    unreachable: Arc<AtomicBool>,
    latency: Arc<Mutex<Duration>>,
}

impl MemoryPointerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Delay applied to every call before it is answered
    pub fn set_latency(&self, latency: Duration) {
        if let Ok(mut guard) = self.latency.lock() {
            *guard = latency;
        }
    }

    /// Accepted writes, in order
    pub fn history(&self) -> Vec<PublishEntry> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    pub fn current(&self, key: &PointerKey) -> Option<PointerRecord> {
        self.records.lock().ok().and_then(|r| r.get(key).cloned())
    }

    async fn enter(&self) -> Result<(), PointerError> {
        let latency = *self.latency.lock().map_err(handle_poison)?;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(PointerError::Unreachable("no replica reachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl NamedPointerStore for MemoryPointerStore {
    async fn resolve(&self, key: &PointerKey) -> Result<PointerRecord, PointerError> {
        self.enter().await?;
        self.records
            .lock()
            .map_err(handle_poison)?
            .get(key)
            .cloned()
            .ok_or(PointerError::NotFound(*key))
    }

    async fn publish(
        &self,
        key: &PointerKey,
        content_ref: ContentRef,
        credential: &RegistryCredential,
    ) -> Result<u64, PointerError> {
        self.enter().await?;

        let mut records = self.records.lock().map_err(handle_poison)?;
        let sequence = records.get(key).map(|r| r.sequence + 1).unwrap_or(1);
        let record = PointerRecord::sign(*key, content_ref, sequence, credential)?;
        records.insert(*key, record);
        drop(records);

        if let Ok(mut history) = self.history.lock() {
            history.push(PublishEntry {
                key: *key,
                content_ref,
                sequence,
                at: Instant::now(),
            });
        }
        debug!(key = %key, sequence, content_ref = %content_ref.short(), "Pointer updated");
        Ok(sequence)
    }
}
