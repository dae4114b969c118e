/*
    RegistrySynchronizer - one resolve/merge/publish cycle

    Every peer runs the same cycle against the shared named pointer:

      1. resolve the pointer and fetch + parse the snapshot it names
      2. merge the remote entries into the local membership, then add self
      3. collect stale entries (timestamped policy only)
      4. render the merged list to the members watch
      5. decide: publish when nothing was resolvable, or when our own
         publish cooldown has elapsed
      6. publish: store the snapshot, announce it, move the pointer

    The cooldown is the only thing standing between N peers and N writes per
    interval. The "nothing resolvable" escape hatch seeds an empty registry;
    two peers seeding at once is harmless because the store orders writes by
    sequence and both converge on the next read.

    A cycle that is still running when the next one starts makes the new one
    return `CycleOutcome::Overlapped` immediately.
*/

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::membership::{decode_snapshot, MergePolicy, Membership, RegistryEntry};
use super::RegistryError;
use crate::clock::Clock;
use crate::config::RegistryConfig;
use crate::core_content::{ContentRef, ContentStore};
use crate::core_identity::RegistryCredential;
use crate::core_pointer::{NamedPointerStore, PointerError, PointerKey, PointerRecord};
use crate::metrics;

/// Where this cycle's remote view came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveSource {
    Resolved { sequence: u64 },
    /// The pointer has never been written
    Empty,
    /// Timeout, outage, bad signature or unreadable snapshot
    Unavailable { reason: String },
}

impl ResolveSource {
    /// Nothing usable came back; the registry must be (re)seeded
    pub fn is_none(&self) -> bool {
        !matches!(self, ResolveSource::Resolved { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResolveSource::Resolved { .. } => "resolved",
            ResolveSource::Empty => "empty",
            ResolveSource::Unavailable { .. } => "unavailable",
        }
    }
}

/// Informational status for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Resolving,
    Publishing,
    Synced { sequence: u64 },
    WaitingForConnection,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Idle => write!(f, "idle"),
            SyncStatus::Resolving => write!(f, "resolving"),
            SyncStatus::Publishing => write!(f, "publishing"),
            SyncStatus::Synced { sequence } => write!(f, "synced (seq {})", sequence),
            SyncStatus::WaitingForConnection => write!(f, "waiting for connection"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishResult {
    Published { sequence: u64, content_ref: ContentRef },
    /// Cooldown still running
    Skipped { remaining: Duration },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub source: ResolveSource,
    /// Entries added or refreshed from the remote view
    pub merged: usize,
    pub collected: Vec<String>,
    pub members: usize,
    pub publish: PublishResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// Another cycle held the guard
    Overlapped,
}

#[derive(Default)]
struct SyncState {
    known: Membership,
    last_publish_at: Option<Instant>,
    last_observed: Option<PointerRecord>,
    last_published_sequence: Option<u64>,
}

pub struct RegistrySynchronizer {
    local_name: String,
    config: RegistryConfig,
    policy: MergePolicy,
    key: PointerKey,
    credential: RegistryCredential,
    pointers: Arc<dyn NamedPointerStore>,
    content: Arc<dyn ContentStore>,
    clock: Arc<dyn Clock>,
    state: Mutex<SyncState>,
    status_tx: watch::Sender<SyncStatus>,
    members_tx: watch::Sender<Vec<RegistryEntry>>,
}

impl RegistrySynchronizer {
    pub fn new(
        local_name: impl Into<String>,
        config: RegistryConfig,
        credential: RegistryCredential,
        pointers: Arc<dyn NamedPointerStore>,
        content: Arc<dyn ContentStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (status_tx, _) = watch::channel(SyncStatus::Idle);
        let (members_tx, _) = watch::channel(Vec::new());
        Self {
            local_name: local_name.into(),
            policy: MergePolicy::from_config(&config),
            config,
            key: credential.pointer_key(),
            credential,
            pointers,
            content,
            clock,
            state: Mutex::new(SyncState::default()),
            status_tx,
            members_tx,
        }
    }

    pub fn pointer_key(&self) -> PointerKey {
        self.key
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    /// Merged member list, sorted by name, updated every cycle
    pub fn members(&self) -> watch::Receiver<Vec<RegistryEntry>> {
        self.members_tx.subscribe()
    }

    /// Record the last successful resolve saw, if any
    pub async fn last_observed(&self) -> Option<PointerRecord> {
        self.state.lock().await.last_observed.clone()
    }

    pub async fn last_published_sequence(&self) -> Option<u64> {
        self.state.lock().await.last_published_sequence
    }

    pub async fn run_cycle(&self) -> CycleOutcome {
        let Ok(mut state) = self.state.try_lock() else {
            debug!("Registry cycle already running, skipping tick");
            metrics::registry_cycle("overlapped", 0.0);
            return CycleOutcome::Overlapped;
        };
        let started = self.clock.now();

        self.status_tx.send_replace(SyncStatus::Resolving);
        let (source, remote) = match timeout(self.config.resolve_timeout, self.fetch_remote()).await {
            Ok(Ok((record, entries))) => {
                let source = ResolveSource::Resolved {
                    sequence: record.sequence,
                };
                state.last_observed = Some(record);
                (source, entries)
            }
            Ok(Err(RegistryError::Pointer(PointerError::NotFound(_)))) => (ResolveSource::Empty, Vec::new()),
            Ok(Err(e)) => (ResolveSource::Unavailable { reason: e.to_string() }, Vec::new()),
            Err(_) => (
                ResolveSource::Unavailable {
                    reason: RegistryError::Timeout(self.config.resolve_timeout).to_string(),
                },
                Vec::new(),
            ),
        };
        match &source {
            ResolveSource::Resolved { sequence } => {
                debug!(sequence, entries = remote.len(), "Registry resolved")
            }
            ResolveSource::Empty => info!("Registry empty, seeding"),
            ResolveSource::Unavailable { reason } => warn!(%reason, "Registry unavailable"),
        }

        let merged = state.known.merge_remote(&remote, self.policy);
        let now_ms = self.clock.unix_millis();
        state.known.upsert_self(&self.local_name, now_ms, self.policy);
        let collected = state.known.collect_garbage(&self.local_name, now_ms, self.policy);
        if !collected.is_empty() {
            debug!(?collected, "Collected stale registry entries");
        }

        let members = state.known.entries();
        metrics::set_registry_members(members.len());
        let member_count = members.len();
        self.members_tx.send_replace(members);

        let now = self.clock.now();
        let publish = match self.cooldown_remaining(&state, now) {
            Some(remaining) if !source.is_none() => {
                metrics::registry_publish("skipped");
                debug!(?remaining, "Publish cooldown active");
                PublishResult::Skipped { remaining }
            }
            _ => {
                self.status_tx.send_replace(SyncStatus::Publishing);
                match self.publish(&state.known).await {
                    Ok((sequence, content_ref)) => {
                        state.last_publish_at = Some(self.clock.now());
                        state.last_published_sequence = Some(sequence);
                        metrics::registry_publish("ok");
                        info!(sequence, members = member_count, content_ref = %content_ref.short(), "Registry published");
                        PublishResult::Published { sequence, content_ref }
                    }
                    Err(e) => {
                        metrics::registry_publish("failed");
                        warn!(error = %e, "Registry publish failed, retrying next cycle");
                        PublishResult::Failed { reason: e.to_string() }
                    }
                }
            }
        };

        let status = match (&publish, &source) {
            (PublishResult::Published { sequence, .. }, _) => SyncStatus::Synced { sequence: *sequence },
            (PublishResult::Skipped { .. }, ResolveSource::Resolved { sequence }) => {
                SyncStatus::Synced { sequence: *sequence }
            }
            _ => SyncStatus::WaitingForConnection,
        };
        self.status_tx.send_replace(status);

        let elapsed = self.clock.now().saturating_duration_since(started);
        metrics::registry_cycle(source.as_str(), elapsed.as_secs_f64());

        CycleOutcome::Completed(CycleReport {
            source,
            merged,
            collected,
            members: member_count,
            publish,
        })
    }

    /// Time left before we may publish again; `None` once it has elapsed
    fn cooldown_remaining(&self, state: &SyncState, now: Instant) -> Option<Duration> {
        let last = state.last_publish_at?;
        let since = now.saturating_duration_since(last);
        self.config.publish_cooldown.checked_sub(since).filter(|d| !d.is_zero())
    }

    async fn fetch_remote(&self) -> Result<(PointerRecord, Vec<RegistryEntry>), RegistryError> {
        let record = self.pointers.resolve(&self.key).await?;
        if record.key != self.key {
            return Err(PointerError::InvalidRecord(format!("record is for {}", record.key)).into());
        }
        record.verify()?;
        let bytes = self.content.get(&record.content_ref).await?;
        let entries = decode_snapshot(&bytes)?;
        Ok((record, entries))
    }

    async fn publish(&self, known: &Membership) -> Result<(u64, ContentRef), RegistryError> {
        let bytes = known.encode()?;
        let write = async {
            let content_ref = self.content.put(bytes).await?;
            if let Err(e) = self.content.announce(&content_ref).await {
                debug!(error = %e, "Snapshot announce failed");
            }
            let sequence = self.pointers.publish(&self.key, content_ref, &self.credential).await?;
            Ok::<_, RegistryError>((sequence, content_ref))
        };
        timeout(self.config.publish_timeout, write)
            .await
            .map_err(|_| RegistryError::Timeout(self.config.publish_timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::config::MergePolicyKind;
    use crate::core_content::MemoryContentStore;
    use crate::core_pointer::MemoryPointerStore;

    struct Fixture {
        pointers: MemoryPointerStore,
        content: MemoryContentStore,
        credential: RegistryCredential,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                pointers: MemoryPointerStore::new(),
                content: MemoryContentStore::new(),
                credential: RegistryCredential::generate(),
            }
        }

        fn peer(&self, name: &str, config: RegistryConfig) -> RegistrySynchronizer {
            RegistrySynchronizer::new(
                name,
                config,
                self.credential.clone(),
                Arc::new(self.pointers.clone()),
                Arc::new(self.content.clone()),
                Arc::new(SystemClock::new()),
            )
        }

        fn peer_with_clock(&self, name: &str, config: RegistryConfig, clock: Arc<ManualClock>) -> RegistrySynchronizer {
            RegistrySynchronizer::new(
                name,
                config,
                self.credential.clone(),
                Arc::new(self.pointers.clone()),
                Arc::new(self.content.clone()),
                clock,
            )
        }
    }

    fn completed(outcome: CycleOutcome) -> CycleReport {
        match outcome {
            CycleOutcome::Completed(report) => report,
            CycleOutcome::Overlapped => panic!("cycle overlapped"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_registry_is_seeded_on_first_cycle() {
        let fx = Fixture::new();
        let alice = fx.peer("alice", RegistryConfig::default());

        let report = completed(alice.run_cycle().await);
        assert_eq!(report.source, ResolveSource::Empty);
        assert!(matches!(report.publish, PublishResult::Published { sequence: 1, .. }));

        let record = fx.pointers.current(&alice.pointer_key()).unwrap();
        let bytes = fx.content.get(&record.content_ref).await.unwrap();
        assert_eq!(bytes, br#"[{"displayName":"alice"}]"#.to_vec());
        assert_eq!(fx.content.announced(), vec![record.content_ref]);
        assert_eq!(*alice.status().borrow(), SyncStatus::Synced { sequence: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_seed_publishes_despite_cooldown_when_unresolvable() {
        let fx = Fixture::new();
        let alice = fx.peer("alice", RegistryConfig::default());
        completed(alice.run_cycle().await);

        fx.pointers.set_reachable(false);
        // cooldown is still running, yet the write is attempted
        let report = completed(alice.run_cycle().await);
        assert!(matches!(report.source, ResolveSource::Unavailable { .. }));
        assert!(matches!(report.publish, PublishResult::Failed { .. }));
        assert_eq!(*alice.status().borrow(), SyncStatus::WaitingForConnection);

        fx.pointers.set_reachable(true);
        fx.content.set_offline(true);
        let report = completed(alice.run_cycle().await);
        assert!(matches!(report.source, ResolveSource::Unavailable { .. }));
        assert!(matches!(report.publish, PublishResult::Failed { .. }));
        assert_eq!(alice.last_published_sequence().await, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_skips_publish_when_resolved() {
        let fx = Fixture::new();
        let alice = fx.peer("alice", RegistryConfig::default());
        completed(alice.run_cycle().await);

        tokio::time::advance(Duration::from_secs(15)).await;
        let report = completed(alice.run_cycle().await);
        assert_eq!(report.source, ResolveSource::Resolved { sequence: 1 });
        assert_eq!(
            report.publish,
            PublishResult::Skipped {
                remaining: Duration::from_secs(45)
            }
        );
        assert_eq!(*alice.status().borrow(), SyncStatus::Synced { sequence: 1 });

        tokio::time::advance(Duration::from_secs(45)).await;
        let report = completed(alice.run_cycle().await);
        assert!(matches!(report.publish, PublishResult::Published { sequence: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_peer_merges_and_publishes_on_own_clock() {
        let fx = Fixture::new();
        let alice = fx.peer("alice", RegistryConfig::default());
        let bob = fx.peer("bob", RegistryConfig::default());

        completed(alice.run_cycle().await);
        tokio::time::advance(Duration::from_secs(2)).await;

        let report = completed(bob.run_cycle().await);
        assert_eq!(report.source, ResolveSource::Resolved { sequence: 1 });
        assert_eq!(report.merged, 1);
        assert!(matches!(report.publish, PublishResult::Published { sequence: 2, .. }));

        let names: Vec<String> = bob.members().borrow().iter().map(|e| e.display_name.clone()).collect();
        assert_eq!(names, vec!["alice", "bob"]);

        tokio::time::advance(Duration::from_secs(15)).await;
        let report = completed(alice.run_cycle().await);
        assert_eq!(report.source, ResolveSource::Resolved { sequence: 2 });
        assert!(matches!(report.publish, PublishResult::Skipped { .. }));
        assert_eq!(alice.members().borrow().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_cycle_is_rejected() {
        let fx = Fixture::new();
        fx.pointers.set_latency(Duration::from_secs(3));
        let alice = Arc::new(fx.peer("alice", RegistryConfig::default()));

        let first = tokio::spawn({
            let alice = alice.clone();
            async move { alice.run_cycle().await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(alice.run_cycle().await, CycleOutcome::Overlapped);
        assert!(matches!(first.await.unwrap(), CycleOutcome::Completed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_timeout_counts_as_unavailable() {
        let fx = Fixture::new();
        fx.pointers.set_latency(Duration::from_secs(11));
        let alice = fx.peer("alice", RegistryConfig::default());

        let report = completed(alice.run_cycle().await);
        assert!(matches!(report.source, ResolveSource::Unavailable { .. }));
        // publish also sees the latency but fits in its 20s budget
        assert!(matches!(report.publish, PublishResult::Published { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_snapshot_is_unavailable_not_empty() {
        let fx = Fixture::new();
        let alice = fx.peer("alice", RegistryConfig::default());
        let garbage = fx.content.put(b"<html>".to_vec()).await.unwrap();
        fx.pointers
            .publish(&alice.pointer_key(), garbage, &fx.credential)
            .await
            .unwrap();

        let report = completed(alice.run_cycle().await);
        assert!(matches!(report.source, ResolveSource::Unavailable { .. }));
        assert!(matches!(report.publish, PublishResult::Published { sequence: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timestamped_policy_collects_stale_members() {
        let fx = Fixture::new();
        let config = RegistryConfig {
            policy: MergePolicyKind::Timestamped,
            staleness_window: Duration::from_secs(60),
            ..RegistryConfig::default()
        };
        let stale_at = SystemClock::new().unix_millis() - 120_000;
        let snapshot = serde_json::to_vec(&vec![RegistryEntry::seen_at("ghost", stale_at)]).unwrap();
        let content_ref = fx.content.put(snapshot).await.unwrap();
        fx.pointers
            .publish(&fx.credential.pointer_key(), content_ref, &fx.credential)
            .await
            .unwrap();

        let alice = fx.peer("alice", config);
        let report = completed(alice.run_cycle().await);
        assert_eq!(report.merged, 1);
        assert_eq!(report.collected, vec!["ghost".to_string()]);
        assert_eq!(report.members, 1);
    }

    #[tokio::test]
    async fn test_last_seen_and_cooldown_follow_injected_clock() {
        let fx = Fixture::new();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let config = RegistryConfig {
            policy: MergePolicyKind::Timestamped,
            ..RegistryConfig::default()
        };
        let alice = fx.peer_with_clock("alice", config, clock.clone());

        completed(alice.run_cycle().await);
        assert_eq!(alice.members().borrow()[0], RegistryEntry::seen_at("alice", 1_000_000));

        clock.advance(Duration::from_secs(30));
        let report = completed(alice.run_cycle().await);
        assert_eq!(
            report.publish,
            PublishResult::Skipped {
                remaining: Duration::from_secs(30)
            }
        );
        assert_eq!(alice.members().borrow()[0], RegistryEntry::seen_at("alice", 1_030_000));
    }
}
