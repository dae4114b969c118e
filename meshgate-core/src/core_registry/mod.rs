//! Registry synchronization
//!
//! Converges a membership list across peers that share no direct channel,
//! using one signed named pointer as the rendezvous point. See
//! [`RegistrySynchronizer`] for the cycle itself; [`RegistryService`] runs it
//! on a fixed interval.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

mod membership;
mod synchronizer;

pub use membership::{decode_snapshot, MergePolicy, Membership, RegistryEntry};
pub use synchronizer::{
    CycleOutcome, CycleReport, PublishResult, RegistrySynchronizer, ResolveSource, SyncStatus,
};

use crate::core_content::ContentError;
use crate::core_pointer::PointerError;
use crate::shutdown::ShutdownListener;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error(transparent)]
    Pointer(#[from] PointerError),

    #[error(transparent)]
    Content(#[from] ContentError),

    #[error("Malformed registry snapshot: {0}")]
    MalformedSnapshot(String),

    #[error("Failed to encode registry snapshot: {0}")]
    Encode(String),

    #[error("Registry operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Read side of a running registry
#[derive(Clone)]
pub struct RegistryHandle {
    sync: Arc<RegistrySynchronizer>,
}

impl RegistryHandle {
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.sync.status()
    }

    pub fn members(&self) -> watch::Receiver<Vec<RegistryEntry>> {
        self.sync.members()
    }

    /// Run a cycle now, outside the schedule
    pub async fn sync_now(&self) -> CycleOutcome {
        self.sync.run_cycle().await
    }
}

/// Runs a cycle every `sync_interval`, each in its own task
pub struct RegistryService {
    sync: Arc<RegistrySynchronizer>,
    interval: Duration,
}

impl RegistryService {
    pub fn new(sync: RegistrySynchronizer, interval: Duration) -> (Self, RegistryHandle) {
        let sync = Arc::new(sync);
        let handle = RegistryHandle { sync: sync.clone() };
        (Self { sync, interval }, handle)
    }

    pub async fn run(self, mut shutdown: ShutdownListener) {
        info!(
            pointer = %self.sync.pointer_key(),
            interval = ?self.interval,
            "Registry sync started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cycles = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    let sync = self.sync.clone();
                    cycles.spawn(async move { sync.run_cycle().await });
                }
                Some(joined) = cycles.join_next() => match joined {
                    Ok(CycleOutcome::Overlapped) => debug!("Registry tick overlapped a running cycle"),
                    Ok(CycleOutcome::Completed(report)) => debug!(
                        source = report.source.as_str(),
                        members = report.members,
                        "Registry cycle finished"
                    ),
                    Err(e) => warn!(error = %e, "Registry cycle task failed"),
                },
            }
        }

        cycles.shutdown().await;
        info!("Registry sync stopped");
    }
}
