//! Concurrent credential ledger.
//!
//! Uses ArcSwap for lock-free reads:
//! - `validate` loads the current snapshot and never waits on writers
//! - add/delete build a new snapshot and swap it in with `rcu`, so
//!   concurrent writers never drop each other's changes
//! - counters live behind an `Arc` shared by every snapshot that contains
//!   the key, so `consume` is a pair of atomic adds

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::key::CredentialKey;

/// Point-in-time usage of one credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialUsage {
    pub key: CredentialKey,
    /// Bytes received from the client.
    #[serde(rename = "up")]
    pub uploaded: u64,
    /// Bytes sent back to the client.
    #[serde(rename = "down")]
    pub downloaded: u64,
}

#[derive(Debug, Default)]
struct Counters {
    uploaded: AtomicU64,
    downloaded: AtomicU64,
}

impl Counters {
    fn starting_at(uploaded: u64, downloaded: u64) -> Self {
        Self {
            uploaded: AtomicU64::new(uploaded),
            downloaded: AtomicU64::new(downloaded),
        }
    }
}

/// Immutable key set; counters are shared, not copied, between snapshots.
#[derive(Debug, Default)]
struct LedgerSnapshot {
    entries: HashMap<CredentialKey, Arc<Counters>>,
}

impl LedgerSnapshot {
    fn with_entry(&self, key: CredentialKey, counters: Arc<Counters>) -> Self {
        let mut entries = self.entries.clone();
        entries.insert(key, counters);
        Self { entries }
    }

    fn without(&self, key: &CredentialKey) -> Self {
        let mut entries = self.entries.clone();
        entries.remove(key);
        Self { entries }
    }
}

/// Key → usage counters, shared by every connection and the admin surface.
#[derive(Debug)]
pub struct CredentialLedger {
    snapshot: ArcSwap<LedgerSnapshot>,
}

impl CredentialLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(LedgerSnapshot::default()),
        }
    }

    /// Add the credential for `password`.
    ///
    /// Re-adding an existing password leaves its counters untouched.
    pub fn add(&self, password: &str) -> CredentialKey {
        let key = CredentialKey::derive(password);
        self.add_key(key);
        key
    }

    /// Add a pre-hashed key. Returns false if it was already present.
    pub fn add_key(&self, key: CredentialKey) -> bool {
        let inserted = self.insert_with(key, Counters::default);
        if inserted {
            info!(key = ?key, "Credential added");
        }
        inserted
    }

    /// Restore a persisted credential together with its counters.
    ///
    /// Existing entries win; restoring never rewinds live counters.
    pub fn restore(&self, usage: CredentialUsage) -> bool {
        self.insert_with(usage.key, || {
            Counters::starting_at(usage.uploaded, usage.downloaded)
        })
    }

    fn insert_with(&self, key: CredentialKey, counters: impl Fn() -> Counters) -> bool {
        let mut inserted = false;
        self.snapshot.rcu(|current| {
            if current.entries.contains_key(&key) {
                inserted = false;
                return Arc::clone(current);
            }
            inserted = true;
            Arc::new(current.with_entry(key, Arc::new(counters())))
        });
        inserted
    }

    /// Membership test on raw key bytes as read off a connection.
    pub fn validate(&self, key: &[u8]) -> bool {
        match CredentialKey::from_bytes(key) {
            Ok(key) => self.contains(&key),
            Err(_) => false,
        }
    }

    /// Membership test on a parsed key.
    pub fn contains(&self, key: &CredentialKey) -> bool {
        self.snapshot.load().entries.contains_key(key)
    }

    /// Add transferred byte counts to a credential.
    ///
    /// A key that is absent (never added, or deleted while a relay was in
    /// flight) is ignored.
    pub fn consume(&self, key: &CredentialKey, uploaded: u64, downloaded: u64) {
        let snapshot = self.snapshot.load();
        match snapshot.entries.get(key) {
            Some(counters) => {
                counters.uploaded.fetch_add(uploaded, Ordering::Relaxed);
                counters.downloaded.fetch_add(downloaded, Ordering::Relaxed);
            }
            None => {
                debug!(key = ?key, uploaded, downloaded, "Usage for unknown credential dropped");
            }
        }
    }

    /// Remove the credential for `password`. Returns false if absent.
    pub fn delete(&self, password: &str) -> bool {
        self.delete_key(&CredentialKey::derive(password))
    }

    /// Remove a pre-hashed key. Returns false if absent.
    pub fn delete_key(&self, key: &CredentialKey) -> bool {
        let mut removed = false;
        self.snapshot.rcu(|current| {
            if !current.entries.contains_key(key) {
                removed = false;
                return Arc::clone(current);
            }
            removed = true;
            Arc::new(current.without(key))
        });
        if removed {
            info!(key = ?key, "Credential deleted");
        }
        removed
    }

    /// Current usage of one credential.
    pub fn usage(&self, key: &CredentialKey) -> Option<CredentialUsage> {
        let snapshot = self.snapshot.load();
        snapshot.entries.get(key).map(|counters| read_usage(key, counters))
    }

    /// Visit every credential in the current snapshot.
    ///
    /// Keys added or deleted during the walk are not observed; counters are
    /// read live, one entry at a time.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&CredentialKey, u64, u64),
    {
        let snapshot = self.snapshot.load_full();
        for (key, counters) in &snapshot.entries {
            let usage = read_usage(key, counters);
            visitor(key, usage.uploaded, usage.downloaded);
        }
    }

    /// All credentials, sorted by key.
    pub fn snapshot(&self) -> Vec<CredentialUsage> {
        let mut usages = Vec::new();
        self.for_each(|key, uploaded, downloaded| {
            usages.push(CredentialUsage {
                key: *key,
                uploaded,
                downloaded,
            })
        });
        usages.sort_by(|a, b| a.key.cmp(&b.key));
        usages
    }

    /// Number of credentials.
    pub fn len(&self) -> usize {
        self.snapshot.load().entries.len()
    }

    /// Check if the ledger has no credentials.
    pub fn is_empty(&self) -> bool {
        self.snapshot.load().entries.is_empty()
    }
}

impl Default for CredentialLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn read_usage(key: &CredentialKey, counters: &Counters) -> CredentialUsage {
    CredentialUsage {
        key: *key,
        uploaded: counters.uploaded.load(Ordering::Relaxed),
        downloaded: counters.downloaded.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_add_then_validate() {
        let ledger = CredentialLedger::new();
        let key = ledger.add("secret");

        assert_eq!(key, CredentialKey::derive("secret"));
        assert!(ledger.validate(key.as_bytes()));
        assert_eq!(
            ledger.usage(&key),
            Some(CredentialUsage {
                key,
                uploaded: 0,
                downloaded: 0
            })
        );
    }

    #[test]
    fn test_validate_rejects_unknown_and_garbage() {
        let ledger = CredentialLedger::new();
        ledger.add("secret");

        assert!(!ledger.validate(CredentialKey::derive("other").as_bytes()));
        assert!(!ledger.validate(&[0x16; 56]));
        assert!(!ledger.validate(b"short"));
    }

    #[test]
    fn test_add_is_idempotent() {
        let ledger = CredentialLedger::new();
        let key = ledger.add("secret");
        ledger.consume(&key, 10, 20);

        ledger.add("secret");
        assert!(!ledger.add_key(key));

        assert_eq!(ledger.len(), 1);
        let usage = ledger.usage(&key).unwrap();
        assert_eq!((usage.uploaded, usage.downloaded), (10, 20));
    }

    #[test]
    fn test_consume_unknown_key_is_noop() {
        let ledger = CredentialLedger::new();
        let key = CredentialKey::derive("ghost");

        ledger.consume(&key, 5, 5);

        assert!(ledger.is_empty());
        assert!(ledger.usage(&key).is_none());
    }

    #[test]
    fn test_delete_then_consume() {
        let ledger = CredentialLedger::new();
        let key = ledger.add("secret");
        ledger.consume(&key, 1, 1);

        assert!(ledger.delete("secret"));
        assert!(!ledger.validate(key.as_bytes()));
        assert!(!ledger.delete_key(&key));

        // An in-flight relay finishing after the delete.
        ledger.consume(&key, 100, 100);
        assert!(ledger.usage(&key).is_none());

        // Re-adding starts from zero.
        ledger.add("secret");
        let usage = ledger.usage(&key).unwrap();
        assert_eq!((usage.uploaded, usage.downloaded), (0, 0));
    }

    #[test]
    fn test_restore_keeps_live_counters() {
        let ledger = CredentialLedger::new();
        let key = CredentialKey::derive("secret");

        assert!(ledger.restore(CredentialUsage {
            key,
            uploaded: 7,
            downloaded: 9
        }));
        ledger.consume(&key, 1, 1);
        assert!(!ledger.restore(CredentialUsage {
            key,
            uploaded: 0,
            downloaded: 0
        }));

        let usage = ledger.usage(&key).unwrap();
        assert_eq!((usage.uploaded, usage.downloaded), (8, 10));
    }

    #[test]
    fn test_for_each_visits_all() {
        let ledger = CredentialLedger::new();
        let a = ledger.add("a");
        let b = ledger.add("b");
        ledger.consume(&b, 3, 4);

        let mut seen = HashMap::new();
        ledger.for_each(|key, up, down| {
            seen.insert(*key, (up, down));
        });

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[&a], (0, 0));
        assert_eq!(seen[&b], (3, 4));
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let ledger = CredentialLedger::new();
        for password in ["one", "two", "three", "four"] {
            ledger.add(password);
        }

        let keys: Vec<_> = ledger.snapshot().into_iter().map(|u| u.key).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_concurrent_consume_is_additive() {
        let ledger = CredentialLedger::new();
        let key = ledger.add("shared");

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        ledger.consume(&key, 1, 2);
                    }
                });
            }
        });

        let usage = ledger.usage(&key).unwrap();
        assert_eq!(usage.uploaded, 8000);
        assert_eq!(usage.downloaded, 16000);
    }

    #[test]
    fn test_concurrent_adds_are_not_lost() {
        let ledger = CredentialLedger::new();

        std::thread::scope(|s| {
            for t in 0..8 {
                let ledger = &ledger;
                s.spawn(move || {
                    for i in 0..50 {
                        ledger.add(&format!("user-{t}-{i}"));
                    }
                });
            }
        });

        assert_eq!(ledger.len(), 400);
    }

    #[test]
    fn test_usage_serializes_as_up_down() {
        let key = CredentialKey::derive("secret");
        let usage = CredentialUsage {
            key,
            uploaded: 1,
            downloaded: 2,
        };
        let json = serde_json::to_value(usage).unwrap();
        assert_eq!(json["key"], key.as_str());
        assert_eq!(json["up"], 1);
        assert_eq!(json["down"], 2);
    }

    proptest! {
        #[test]
        fn prop_consume_sums_all_deltas(deltas in prop::collection::vec((0u64..1 << 32, 0u64..1 << 32), 0..64)) {
            let ledger = CredentialLedger::new();
            let key = ledger.add("prop");

            let (left, right) = deltas.split_at(deltas.len() / 2);
            std::thread::scope(|s| {
                for half in [left, right] {
                    let ledger = &ledger;
                    s.spawn(move || {
                        for (up, down) in half {
                            ledger.consume(&key, *up, *down);
                        }
                    });
                }
            });

            let usage = ledger.usage(&key).unwrap();
            prop_assert_eq!(usage.uploaded, deltas.iter().map(|d| d.0).sum::<u64>());
            prop_assert_eq!(usage.downloaded, deltas.iter().map(|d| d.1).sum::<u64>());
        }
    }
}
