//! Content-addressed blob storage
//!
//! The core only needs `put`/`get`/`announce`; how blocks are stored or moved
//! between peers belongs to the host. `MemoryContentStore` is the in-process
//! implementation shared by peers of a simulated mesh.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::trace;

mod content_ref;

pub use content_ref::ContentRef;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContentError {
    #[error("Content not found: {0}")]
    NotFound(ContentRef),

    #[error("Content store unreachable: {0}")]
    Unreachable(String),

    #[error("Invalid content reference: {0}")]
    InvalidRef(String),

    #[error("Content store error: {0}")]
    Internal(String),
}

fn handle_poison<T>(_err: PoisonError<T>) -> ContentError {
    ContentError::Internal("Lock poisoned: a thread panicked while holding the lock".to_string())
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store `data`, returning its reference
    async fn put(&self, data: Vec<u8>) -> Result<ContentRef, ContentError>;

    /// Exact bytes previously stored under `content_ref`
    async fn get(&self, content_ref: &ContentRef) -> Result<Vec<u8>, ContentError>;

    /// Advertise that this peer can serve `content_ref`
    async fn announce(&self, content_ref: &ContentRef) -> Result<(), ContentError> {
        let _ = content_ref;
        Ok(())
    }
}

/// In-memory blob map
#[derive(Clone, Default)]
pub struct MemoryContentStore {
    blobs: Arc<RwLock<HashMap<ContentRef, Vec<u8>>>>,
    announced: Arc<RwLock<Vec<ContentRef>>>,
    offline: Arc<AtomicBool>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with `Unreachable`
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, content_ref: &ContentRef) -> bool {
        self.blobs
            .read()
            .map(|b| b.contains_key(content_ref))
            .unwrap_or(false)
    }

    /// References announced so far, oldest first
    pub fn announced(&self) -> Vec<ContentRef> {
        self.announced.read().map(|a| a.clone()).unwrap_or_default()
    }

    fn check_online(&self) -> Result<(), ContentError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(ContentError::Unreachable("content store is offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(&self, data: Vec<u8>) -> Result<ContentRef, ContentError> {
        self.check_online()?;
        let content_ref = ContentRef::for_bytes(&data);
        self.blobs
            .write()
            .map_err(handle_poison)?
            .entry(content_ref)
            .or_insert(data);
        trace!(content_ref = %content_ref.short(), "Stored blob");
        Ok(content_ref)
    }

    async fn get(&self, content_ref: &ContentRef) -> Result<Vec<u8>, ContentError> {
        self.check_online()?;
        self.blobs
            .read()
            .map_err(handle_poison)?
            .get(content_ref)
            .cloned()
            .ok_or(ContentError::NotFound(*content_ref))
    }

    async fn announce(&self, content_ref: &ContentRef) -> Result<(), ContentError> {
        self.check_online()?;
        let mut announced = self.announced.write().map_err(handle_poison)?;
        if !announced.contains(content_ref) {
            announced.push(*content_ref);
        }
        Ok(())
    }
}
