//! Replicated document: a last-writer-wins map with tombstones.
//!
//! Every key carries a `Stamp` (Lamport clock, replica id). A write wins
//! when its stamp is greater than the stored one, so replicas that have seen
//! the same set of writes hold the same value for every key, in whatever
//! order the writes arrived. Deletions are stored as tombstones (`None`) so
//! a late, older write cannot resurrect a deleted key.
//!
//! The state vector is a per-key version map. Exchanging it lets a replica
//! send exactly the entries the other side lacks or holds in an older
//! version.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Random per-process replica id.
pub type ReplicaId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub clock: u64,
    pub replica: ReplicaId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub stamp: Stamp,
    /// `None` is a tombstone.
    pub value: Option<Value>,
}

/// A batch of entries, as sent over the wire and written to the cache.
pub type Update = BTreeMap<String, Entry>;

/// Latest stamp seen per key.
pub type Versions = BTreeMap<String, Stamp>;

/// Contract of the shared document the engine replicates through.
pub trait ReplicatedDoc: Send {
    /// Apply local writes (`None` deletes) and return the update to broadcast.
    fn apply_local(&mut self, writes: Vec<(String, Option<Value>)>) -> Update;

    /// Merge a remote or cached update. Returns the keys whose value changed.
    fn apply_remote(&mut self, update: &Update) -> Vec<String>;

    fn get(&self, key: &str) -> Option<&Value>;

    fn versions(&self) -> Versions;

    /// Entries the holder of `versions` has not seen.
    fn diff_since(&self, versions: &Versions) -> Update;

    /// Every entry, tombstones included.
    fn encode_state(&self) -> Update;
}

#[derive(Debug, Clone)]
pub struct LwwDoc {
    replica: ReplicaId,
    clock: u64,
    entries: BTreeMap<String, Entry>,
}

impl LwwDoc {
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            clock: 0,
            entries: BTreeMap::new(),
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    fn tick(&mut self) -> Stamp {
        self.clock += 1;
        Stamp {
            clock: self.clock,
            replica: self.replica,
        }
    }
}

impl ReplicatedDoc for LwwDoc {
    fn apply_local(&mut self, writes: Vec<(String, Option<Value>)>) -> Update {
        let mut update = Update::new();
        for (key, value) in writes {
            let unchanged = match self.entries.get(&key) {
                Some(entry) => entry.value == value,
                None => value.is_none(),
            };
            if unchanged {
                continue;
            }
            let entry = Entry {
                stamp: self.tick(),
                value,
            };
            self.entries.insert(key.clone(), entry.clone());
            update.insert(key, entry);
        }
        update
    }

    fn apply_remote(&mut self, update: &Update) -> Vec<String> {
        let mut changed = Vec::new();
        for (key, entry) in update {
            self.clock = self.clock.max(entry.stamp.clock);
            let wins = self
                .entries
                .get(key)
                .is_none_or(|current| entry.stamp > current.stamp);
            if !wins {
                continue;
            }
            let previous = self.entries.insert(key.clone(), entry.clone());
            let before = previous.and_then(|e| e.value);
            if before != entry.value {
                changed.push(key.clone());
            }
        }
        changed
    }

    fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).and_then(|e| e.value.as_ref())
    }

    fn versions(&self) -> Versions {
        self.entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.stamp))
            .collect()
    }

    fn diff_since(&self, versions: &Versions) -> Update {
        self.entries
            .iter()
            .filter(|(key, entry)| versions.get(*key).is_none_or(|seen| entry.stamp > *seen))
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }

    fn encode_state(&self) -> Update {
        self.entries.clone()
    }
}
