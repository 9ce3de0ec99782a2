//! Fault-tolerance aware directory reads.
//!
//! | level | network | local cache                                   |
//! |-------|---------|-----------------------------------------------|
//! | 0     | read    | untouched                                     |
//! | 1     | read    | primed with the result                        |
//! | 2     | read    | taken, restored, merged, then served          |
//!
//! Level 2 never loses what the node already knew: locals taken before the
//! query are put back on every path, including cancellation.
use std::collections::HashMap;
use std::sync::Arc;

use weft_dht::{
    sort_freshest_first, DirectoryError, DirectoryKey, DirectoryStore, FaultTolerance, Freshness,
    LocalEntry,
};

/// Reads directory records at a chosen [`FaultTolerance`] level.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<DirectoryStore>,
}

impl Reconciler {
    pub fn new(store: Arc<DirectoryStore>) -> Self {
        Self { store }
    }

    /// Records for `key` at `level`, one per de-duplication key, freshest first.
    pub async fn resolve<R: Freshness>(
        &self,
        key: &DirectoryKey,
        level: FaultTolerance,
    ) -> Result<Vec<R>, DirectoryError> {
        match level {
            FaultTolerance::NetworkOnly => self.network_only(key).await,
            FaultTolerance::WriteThrough => self.write_through(key).await,
            FaultTolerance::LocalFirst => self.local_first(key).await,
        }
    }

    /// [`resolve`](Self::resolve) at the level configured for the key's namespace.
    pub async fn resolve_configured<R: Freshness>(
        &self,
        key: &DirectoryKey,
    ) -> Result<Vec<R>, DirectoryError> {
        let level = self.store.config().level_for(key.namespace());
        self.resolve(key, level).await
    }

    async fn network_only<R: Freshness>(&self, key: &DirectoryKey) -> Result<Vec<R>, DirectoryError> {
        let values = self.store.get_all(key).await?;
        let records = values
            .iter()
            .filter_map(|v| match serde_json::from_slice::<R>(v) {
                Ok(r) => Some(r),
                Err(e) => {
                    tracing::debug!("reconcile: skipping undecodable replica of {key}: {e}");
                    None
                }
            })
            .collect();
        Ok(collapse(records))
    }

    async fn write_through<R: Freshness>(&self, key: &DirectoryKey) -> Result<Vec<R>, DirectoryError> {
        let records: Vec<R> = self.network_only(key).await?;
        self.merge_into_local(key, &records);
        Ok(records)
    }

    async fn local_first<R: Freshness>(&self, key: &DirectoryKey) -> Result<Vec<R>, DirectoryError> {
        let guard = RestoreGuard {
            store: &self.store,
            key,
            taken: Some(self.store.take_local_entries(key)),
        };
        let had_local = guard.taken.as_ref().is_some_and(|t| !t.is_empty());

        let network = self.network_only::<R>(key).await;
        drop(guard);

        match network {
            Ok(records) => self.merge_into_local(key, &records),
            Err(e) if had_local => {
                tracing::warn!("reconcile: network read of {key} failed, serving local copy: {e}");
            }
            Err(e) => return Err(e),
        }
        Ok(self.store.local_records(key))
    }

    fn merge_into_local<R: Freshness>(&self, key: &DirectoryKey, records: &[R]) {
        for record in records {
            let value = match serde_json::to_vec(record) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("reconcile: cannot re-encode record for {key}: {e}");
                    continue;
                }
            };
            if let Err(e) = self.store.merge_local_entry(key, record.dedup_key(), value) {
                tracing::debug!("reconcile: local merge into {key} rejected: {e}");
            }
        }
    }
}

/// Puts taken local entries back when dropped.
struct RestoreGuard<'a> {
    store: &'a DirectoryStore,
    key: &'a DirectoryKey,
    taken: Option<Vec<LocalEntry>>,
}

impl Drop for RestoreGuard<'_> {
    fn drop(&mut self) {
        if let Some(taken) = self.taken.take() {
            self.store.restore_local_entries(self.key, taken);
        }
    }
}

/// One record per de-duplication key, the freshest one; earliest wins ties.
fn collapse<R: Freshness>(records: Vec<R>) -> Vec<R> {
    let mut best: HashMap<String, R> = HashMap::new();
    for record in records {
        let dedup = record.dedup_key();
        match best.get(&dedup) {
            Some(current) if !record.is_fresher_than(current) => {}
            _ => {
                best.insert(dedup, record);
            }
        }
    }
    let mut out: Vec<R> = best.into_values().collect();
    sort_freshest_first(&mut out);
    out
}
