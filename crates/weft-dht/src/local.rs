//! Node-local mirror of directory state.
//!
//! Two tables behind one lock each:
//! - `slots`: the single value this node last wrote or accepted per key,
//! - `entries`: a multimap of replicas per key, de-duplicated by a
//!   record-defined identity. Reconciliation reads and rewrites it.
//!
//! The mirror is disposable: losing it only costs a network round trip.
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::{DirectoryKey, RecordWrapper};

/// One replica held in the local multimap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub dedup: String,
    pub record: RecordWrapper,
}

#[derive(Default)]
pub(crate) struct LocalCache {
    slots: Mutex<HashMap<DirectoryKey, RecordWrapper>>,
    entries: Mutex<HashMap<DirectoryKey, BTreeMap<String, RecordWrapper>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LocalCache {
    pub(crate) fn slot(&self, key: &DirectoryKey) -> Option<RecordWrapper> {
        lock(&self.slots).get(key).cloned()
    }

    /// Exclusive access to the single-value table for compare-and-set.
    pub(crate) fn slots(&self) -> MutexGuard<'_, HashMap<DirectoryKey, RecordWrapper>> {
        lock(&self.slots)
    }

    /// Remove and return every replica under `key`.
    pub(crate) fn take(&self, key: &DirectoryKey) -> Vec<LocalEntry> {
        lock(&self.entries)
            .remove(key)
            .map(|map| {
                map.into_iter()
                    .map(|(dedup, record)| LocalEntry { dedup, record })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Insert or replace one replica. `keep_existing` decides conflicts.
    pub(crate) fn merge(
        &self,
        key: &DirectoryKey,
        entry: LocalEntry,
        keep_existing: impl FnOnce(&RecordWrapper, &RecordWrapper) -> bool,
    ) -> bool {
        let mut entries = lock(&self.entries);
        let replicas = entries.entry(key.clone()).or_default();
        let replace = match replicas.get(&entry.dedup) {
            None => true,
            Some(existing) if existing.value == entry.record.value => false,
            Some(existing) => !keep_existing(existing, &entry.record),
        };
        if replace {
            replicas.insert(entry.dedup, entry.record);
        }
        replace
    }

    pub(crate) fn entries(&self, key: &DirectoryKey) -> Vec<LocalEntry> {
        lock(&self.entries)
            .get(key)
            .map(|map| {
                map.iter()
                    .map(|(dedup, record)| LocalEntry {
                        dedup: dedup.clone(),
                        record: record.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Keys in `namespace` that hold at least one replica.
    pub(crate) fn keys_in(&self, namespace: &str) -> Vec<DirectoryKey> {
        let mut keys: Vec<DirectoryKey> = lock(&self.entries)
            .keys()
            .filter(|k| k.namespace() == namespace)
            .cloned()
            .collect();
        keys.sort_by_key(|k| k.to_string());
        keys
    }

    pub(crate) fn remove(&self, key: &DirectoryKey) {
        lock(&self.slots).remove(key);
        lock(&self.entries).remove(key);
    }

    pub(crate) fn remove_entry(&self, key: &DirectoryKey, dedup: &str) -> bool {
        let mut entries = lock(&self.entries);
        let Some(replicas) = entries.get_mut(key) else {
            return false;
        };
        let removed = replicas.remove(dedup).is_some();
        if replicas.is_empty() {
            entries.remove(key);
        }
        removed
    }
}
