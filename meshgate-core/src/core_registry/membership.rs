/*
    Membership - the locally known registry and its merge rules

    Entries are keyed by display name in a BTreeMap, so iteration order is the
    snapshot order and identical membership always encodes to identical bytes.

    Merge rules:
      simple      - a name is added the first time it is seen; the first copy
                    of its metadata wins
      timestamped - the copy with the newer `lastSeen` wins; entries older than
                    the staleness window are collected, except our own

    Both merges are idempotent: applying the same remote snapshot twice leaves
    the same map as applying it once.
*/

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::RegistryError;
use crate::config::{MergePolicyKind, RegistryConfig};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub display_name: String,
    /// Unix milliseconds; only written under the timestamped policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<u64>,
}

impl RegistryEntry {
    pub fn named(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            last_seen: None,
        }
    }

    pub fn seen_at(display_name: impl Into<String>, last_seen: u64) -> Self {
        Self {
            display_name: display_name.into(),
            last_seen: Some(last_seen),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    Simple,
    Timestamped { staleness_window: Duration },
}

impl MergePolicy {
    pub fn from_config(config: &RegistryConfig) -> Self {
        match config.policy {
            MergePolicyKind::Simple => MergePolicy::Simple,
            MergePolicyKind::Timestamped => MergePolicy::Timestamped {
                staleness_window: config.staleness_window,
            },
        }
    }
}

/// Parse snapshot bytes. Entries with an empty name are skipped.
pub fn decode_snapshot(data: &[u8]) -> Result<Vec<RegistryEntry>, RegistryError> {
    let entries: Vec<RegistryEntry> =
        serde_json::from_slice(data).map_err(|e| RegistryError::MalformedSnapshot(e.to_string()))?;
    Ok(entries
        .into_iter()
        .filter(|e| !e.display_name.trim().is_empty())
        .collect())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    entries: BTreeMap<String, RegistryEntry>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a remote view into ours; returns how many entries changed
    pub fn merge_remote(&mut self, remote: &[RegistryEntry], policy: MergePolicy) -> usize {
        let mut changed = 0;
        for entry in remote {
            match self.entries.get_mut(&entry.display_name) {
                None => {
                    let mut entry = entry.clone();
                    if policy == MergePolicy::Simple {
                        entry.last_seen = None;
                    }
                    self.entries.insert(entry.display_name.clone(), entry);
                    changed += 1;
                }
                Some(local) => {
                    if let MergePolicy::Timestamped { .. } = policy {
                        if entry.last_seen > local.last_seen {
                            local.last_seen = entry.last_seen;
                            changed += 1;
                        }
                    }
                }
            }
        }
        changed
    }

    /// Declare ourselves a member
    pub fn upsert_self(&mut self, name: &str, now_ms: u64, policy: MergePolicy) {
        let entry = self
            .entries
            .entry(name.to_string())
            .or_insert_with(|| RegistryEntry::named(name));
        if let MergePolicy::Timestamped { .. } = policy {
            entry.last_seen = Some(entry.last_seen.map_or(now_ms, |seen| seen.max(now_ms)));
        }
    }

    /// Drop entries not seen within the staleness window. Entries with no
    /// `lastSeen` carry no recency and are kept.
    pub fn collect_garbage(&mut self, own_name: &str, now_ms: u64, policy: MergePolicy) -> Vec<String> {
        let MergePolicy::Timestamped { staleness_window } = policy else {
            return Vec::new();
        };
        let window_ms = staleness_window.as_millis() as u64;
        let stale: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.display_name != own_name)
            .filter(|e| matches!(e.last_seen, Some(seen) if now_ms.saturating_sub(seen) > window_ms))
            .map(|e| e.display_name.clone())
            .collect();
        for name in &stale {
            self.entries.remove(name);
        }
        stale
    }

    /// Members in snapshot order (by name)
    pub fn entries(&self) -> Vec<RegistryEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deterministic snapshot bytes: a JSON array sorted by name
    pub fn encode(&self) -> Result<Vec<u8>, RegistryError> {
        let entries: Vec<&RegistryEntry> = self.entries.values().collect();
        serde_json::to_vec(&entries).map_err(|e| RegistryError::Encode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const WINDOW: Duration = Duration::from_secs(15 * 60);
    const TIMESTAMPED: MergePolicy = MergePolicy::Timestamped { staleness_window: WINDOW };

    #[test]
    fn test_snapshot_bytes() {
        let mut m = Membership::new();
        m.upsert_self("alice", 0, MergePolicy::Simple);
        assert_eq!(m.encode().unwrap(), br#"[{"displayName":"alice"}]"#.to_vec());

        let mut t = Membership::new();
        t.upsert_self("bob", 42, TIMESTAMPED);
        assert_eq!(t.encode().unwrap(), br#"[{"displayName":"bob","lastSeen":42}]"#.to_vec());
    }

    #[test]
    fn test_same_members_same_bytes_regardless_of_order() {
        let mut a = Membership::new();
        a.merge_remote(&[RegistryEntry::named("zed"), RegistryEntry::named("amy")], MergePolicy::Simple);
        let mut b = Membership::new();
        b.merge_remote(&[RegistryEntry::named("amy"), RegistryEntry::named("zed")], MergePolicy::Simple);
        assert_eq!(a.encode().unwrap(), b.encode().unwrap());
    }

    #[test]
    fn test_decode_rejects_garbage_and_skips_blank_names() {
        assert!(matches!(decode_snapshot(b"{}"), Err(RegistryError::MalformedSnapshot(_))));
        assert!(decode_snapshot(b"not json").is_err());

        let entries = decode_snapshot(br#"[{"displayName":""},{"displayName":"amy","extra":1}]"#).unwrap();
        assert_eq!(entries, vec![RegistryEntry::named("amy")]);
    }

    #[test]
    fn test_simple_policy_first_write_wins() {
        let mut m = Membership::new();
        m.merge_remote(&[RegistryEntry::named("amy")], MergePolicy::Simple);
        let changed = m.merge_remote(&[RegistryEntry::seen_at("amy", 99)], MergePolicy::Simple);
        assert_eq!(changed, 0);
        assert_eq!(m.get("amy"), Some(&RegistryEntry::named("amy")));
    }

    #[test]
    fn test_timestamped_policy_keeps_fresher() {
        let mut m = Membership::new();
        m.merge_remote(&[RegistryEntry::seen_at("amy", 100)], TIMESTAMPED);
        assert_eq!(m.merge_remote(&[RegistryEntry::seen_at("amy", 50)], TIMESTAMPED), 0);
        assert_eq!(m.merge_remote(&[RegistryEntry::seen_at("amy", 150)], TIMESTAMPED), 1);
        assert_eq!(m.get("amy").unwrap().last_seen, Some(150));
    }

    #[test]
    fn test_self_upsert_never_regresses() {
        let mut m = Membership::new();
        m.merge_remote(&[RegistryEntry::seen_at("me", 500)], TIMESTAMPED);
        m.upsert_self("me", 400, TIMESTAMPED);
        assert_eq!(m.get("me").unwrap().last_seen, Some(500));
        m.upsert_self("me", 600, TIMESTAMPED);
        assert_eq!(m.get("me").unwrap().last_seen, Some(600));
    }

    #[test]
    fn test_gc_spares_self_and_untimed() {
        let now = 10 * WINDOW.as_millis() as u64;
        let mut m = Membership::new();
        m.merge_remote(
            &[
                RegistryEntry::seen_at("old", now - WINDOW.as_millis() as u64 - 1),
                RegistryEntry::seen_at("edge", now - WINDOW.as_millis() as u64),
                RegistryEntry::seen_at("me", 0),
                RegistryEntry::named("legacy"),
            ],
            TIMESTAMPED,
        );

        let removed = m.collect_garbage("me", now, TIMESTAMPED);
        assert_eq!(removed, vec!["old".to_string()]);
        assert!(m.contains("me") && m.contains("edge") && m.contains("legacy"));

        assert!(m.collect_garbage("me", u64::MAX, MergePolicy::Simple).is_empty());
    }

    fn entry_strategy() -> impl Strategy<Value = RegistryEntry> {
        ("[a-e]{1,2}", proptest::option::of(0u64..1_000)).prop_map(|(name, seen)| RegistryEntry {
            display_name: name,
            last_seen: seen,
        })
    }

    fn policy_strategy() -> impl Strategy<Value = MergePolicy> {
        prop_oneof![Just(MergePolicy::Simple), Just(TIMESTAMPED)]
    }

    proptest! {
        #[test]
        fn prop_merge_is_idempotent(
            local in proptest::collection::vec(entry_strategy(), 0..8),
            remote in proptest::collection::vec(entry_strategy(), 0..8),
            policy in policy_strategy(),
        ) {
            let mut once = Membership::new();
            once.merge_remote(&local, policy);
            once.merge_remote(&remote, policy);

            let mut twice = once.clone();
            let changed = twice.merge_remote(&remote, policy);

            prop_assert_eq!(changed, 0);
            prop_assert_eq!(&once, &twice);
            prop_assert_eq!(once.encode().unwrap(), twice.encode().unwrap());
        }

        #[test]
        fn prop_merge_never_loses_names(
            local in proptest::collection::vec(entry_strategy(), 0..8),
            remote in proptest::collection::vec(entry_strategy(), 0..8),
            policy in policy_strategy(),
        ) {
            let mut m = Membership::new();
            m.merge_remote(&local, policy);
            m.merge_remote(&remote, policy);
            for e in local.iter().chain(remote.iter()) {
                prop_assert!(m.contains(&e.display_name));
            }
        }
    }
}
