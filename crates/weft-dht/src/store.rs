//! Directory store: validated get/put over the overlay plus a local mirror.
//!
//! Put semantics are last-writer-wins by the validator's ordering, not by
//! physical arrival: a put that loses `select` against the current local
//! value is a silent no-op.
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use weft_transport::PeerId;

use crate::local::LocalCache;
use crate::{
    DirectoryConfig, DirectoryError, DirectoryKey, Freshness, LocalEntry, Overlay, PeerRoute,
    RecordWrapper, Validator,
};

/// What a put did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Written locally (and offered to the network for `put`).
    Stored,
    /// Identical to the current value; nothing touched.
    Unchanged,
    /// The current value is fresher; the put was dropped.
    KeptExisting,
}

/// Typed directory access for one node.
pub struct DirectoryStore {
    overlay: Arc<dyn Overlay>,
    validator: Arc<dyn Validator>,
    config: DirectoryConfig,
    local: LocalCache,
}

impl DirectoryStore {
    pub fn new(
        overlay: Arc<dyn Overlay>,
        validator: Arc<dyn Validator>,
        config: DirectoryConfig,
    ) -> Self {
        Self {
            overlay,
            validator,
            config,
            local: LocalCache::default(),
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        self.overlay.local_peer()
    }

    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    pub fn validator(&self) -> &Arc<dyn Validator> {
        &self.validator
    }

    // ── Network ──────────────────────────────────────────────────────

    /// Validate, settle against the local copy, then write locally and to
    /// the overlay.
    ///
    /// On best-effort namespaces `NoPeersInRoutingTable` and `StaleValue`
    /// from the overlay are reported as success.
    pub async fn put(&self, key: &DirectoryKey, value: Vec<u8>) -> Result<PutOutcome, DirectoryError> {
        let (wrapped, previous) = match self.settle_local(key, value)? {
            Settled::Stored { wrapped, previous } => (wrapped, previous),
            Settled::Skipped(outcome) => return Ok(outcome),
        };

        match self.bounded(self.overlay.put_value(key, wrapped.encode())).await {
            Ok(()) => Ok(PutOutcome::Stored),
            Err(e) if e.is_steady_state() && self.config.is_best_effort(key.namespace()) => {
                tracing::debug!("directory: put {key} kept local only: {e}");
                Ok(PutOutcome::Stored)
            }
            Err(e) => {
                self.roll_back(key, &wrapped, previous);
                Err(e)
            }
        }
    }

    /// Best value for `key` on the network.
    pub async fn get(&self, key: &DirectoryKey) -> Result<Vec<u8>, DirectoryError> {
        let raw = self.bounded(self.overlay.get_value(key)).await?;
        let wrapper = RecordWrapper::decode(&raw)?;
        self.validator.validate(key, &wrapper.value)?;
        Ok(wrapper.value)
    }

    /// Every valid replica of `key` seen in one fan-out, duplicates collapsed.
    pub async fn get_all(&self, key: &DirectoryKey) -> Result<Vec<Vec<u8>>, DirectoryError> {
        let raw = self.bounded(self.overlay.search_value(key)).await?;

        let mut values: Vec<Vec<u8>> = Vec::with_capacity(raw.len());
        for bytes in raw {
            let wrapper = match RecordWrapper::decode(&bytes) {
                Ok(w) => w,
                Err(e) => {
                    tracing::warn!("directory: dropping unreadable replica of {key}: {e}");
                    continue;
                }
            };
            if let Err(e) = self.validator.validate(key, &wrapper.value) {
                tracing::warn!("directory: dropping invalid replica of {key}: {e}");
                continue;
            }
            if !values.contains(&wrapper.value) {
                values.push(wrapper.value);
            }
        }

        if values.is_empty() {
            return Err(DirectoryError::NotFound {
                key: key.to_string(),
            });
        }
        Ok(values)
    }

    /// Current route to a peer via the overlay.
    pub async fn find_peer(&self, peer: &PeerId) -> Result<PeerRoute, DirectoryError> {
        self.bounded(self.overlay.find_peer(peer)).await
    }

    pub async fn closest_peers(&self, key: &DirectoryKey) -> Result<Vec<PeerId>, DirectoryError> {
        self.bounded(self.overlay.get_closest_peers(key)).await
    }

    pub async fn bootstrap(&self) -> Result<(), DirectoryError> {
        self.bounded(self.overlay.bootstrap()).await
    }

    // ── Local single-value ───────────────────────────────────────────

    /// Same rules as [`put`](Self::put) without the network write.
    pub fn put_local(&self, key: &DirectoryKey, value: Vec<u8>) -> Result<PutOutcome, DirectoryError> {
        match self.settle_local(key, value)? {
            Settled::Stored { .. } => Ok(PutOutcome::Stored),
            Settled::Skipped(outcome) => Ok(outcome),
        }
    }

    pub fn get_local(&self, key: &DirectoryKey) -> Option<Vec<u8>> {
        self.local.slot(key).map(|w| w.value)
    }

    /// The wrapped local value, including when it was received.
    pub fn get_local_wrapped(&self, key: &DirectoryKey) -> Option<RecordWrapper> {
        self.local.slot(key)
    }

    // ── Typed helpers ────────────────────────────────────────────────

    pub async fn put_record<R: Serialize>(
        &self,
        key: &DirectoryKey,
        record: &R,
    ) -> Result<PutOutcome, DirectoryError> {
        self.put(key, serde_json::to_vec(record)?).await
    }

    pub async fn get_record<R: DeserializeOwned>(&self, key: &DirectoryKey) -> Result<R, DirectoryError> {
        Ok(serde_json::from_slice(&self.get(key).await?)?)
    }

    /// Every decodable replica of `key`.
    pub async fn get_all_records<R: DeserializeOwned>(
        &self,
        key: &DirectoryKey,
    ) -> Result<Vec<R>, DirectoryError> {
        let values = self.get_all(key).await?;
        Ok(values
            .iter()
            .filter_map(|v| serde_json::from_slice(v).ok())
            .collect())
    }

    pub fn get_local_record<R: DeserializeOwned>(&self, key: &DirectoryKey) -> Option<R> {
        self.get_local(key)
            .and_then(|v| serde_json::from_slice(&v).ok())
    }

    // ── Local multimap ───────────────────────────────────────────────

    /// Remove and return every local replica under `key`.
    pub fn take_local_entries(&self, key: &DirectoryKey) -> Vec<LocalEntry> {
        self.local.take(key)
    }

    /// Put previously taken replicas back. Anything merged in the
    /// meantime is settled by `select`.
    pub fn restore_local_entries(&self, key: &DirectoryKey, entries: Vec<LocalEntry>) {
        for entry in entries {
            self.merge_wrapped(key, entry);
        }
    }

    /// Insert one replica under its de-duplication identity.
    ///
    /// Returns whether the multimap changed. Invalid values are rejected.
    pub fn merge_local_entry(
        &self,
        key: &DirectoryKey,
        dedup: impl Into<String>,
        value: Vec<u8>,
    ) -> Result<bool, DirectoryError> {
        self.validator.validate(key, &value)?;
        Ok(self.merge_wrapped(
            key,
            LocalEntry {
                dedup: dedup.into(),
                record: RecordWrapper::new(value),
            },
        ))
    }

    /// Inner values of every local replica under `key`.
    pub fn local_entries(&self, key: &DirectoryKey) -> Vec<Vec<u8>> {
        self.local
            .entries(key)
            .into_iter()
            .map(|e| e.record.value)
            .collect()
    }

    /// Decodable local replicas of `key`, freshest first.
    pub fn local_records<R: Freshness>(&self, key: &DirectoryKey) -> Vec<R> {
        let mut records: Vec<R> = self
            .local
            .entries(key)
            .iter()
            .filter_map(|e| serde_json::from_slice(&e.record.value).ok())
            .collect();
        sort_freshest_first(&mut records);
        records
    }

    /// Keys in `namespace` with at least one local replica.
    pub fn local_keys(&self, namespace: &str) -> Vec<DirectoryKey> {
        self.local.keys_in(namespace)
    }

    /// Drop every local trace of `key`.
    pub fn remove_local(&self, key: &DirectoryKey) {
        self.local.remove(key);
    }

    pub fn remove_local_entry(&self, key: &DirectoryKey, dedup: &str) -> bool {
        self.local.remove_entry(key, dedup)
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn settle_local(&self, key: &DirectoryKey, value: Vec<u8>) -> Result<Settled, DirectoryError> {
        self.validator.validate(key, &value)?;

        let mut slots = self.local.slots();
        if let Some(existing) = slots.get(key) {
            if existing.value == value {
                return Ok(Settled::Skipped(PutOutcome::Unchanged));
            }
            if self.validator.select(key, &[&existing.value, &value])? == 0 {
                tracing::debug!("directory: put {key} ignored, existing value is fresher");
                return Ok(Settled::Skipped(PutOutcome::KeptExisting));
            }
        }
        let wrapped = RecordWrapper::new(value);
        let previous = slots.insert(key.clone(), wrapped.clone());
        Ok(Settled::Stored { wrapped, previous })
    }

    /// Undo a local write whose network write failed, unless a later put
    /// has replaced it since.
    fn roll_back(&self, key: &DirectoryKey, written: &RecordWrapper, previous: Option<RecordWrapper>) {
        let mut slots = self.local.slots();
        if slots.get(key) != Some(written) {
            return;
        }
        match previous {
            Some(previous) => {
                slots.insert(key.clone(), previous);
            }
            None => {
                slots.remove(key);
            }
        }
        tracing::debug!("directory: put {key} failed, local copy rolled back");
    }

    fn merge_wrapped(&self, key: &DirectoryKey, entry: LocalEntry) -> bool {
        self.local.merge(key, entry, |existing, incoming| {
            match self.validator.select(key, &[&existing.value, &incoming.value]) {
                Ok(winner) => winner == 0,
                Err(e) => {
                    tracing::debug!("directory: merge into {key} kept existing: {e}");
                    true
                }
            }
        })
    }

    async fn bounded<T>(
        &self,
        query: impl Future<Output = Result<T, DirectoryError>>,
    ) -> Result<T, DirectoryError> {
        let after = self.config.query_timeout;
        tokio::time::timeout(after, query)
            .await
            .map_err(|_| DirectoryError::Timeout { after })?
    }
}

enum Settled {
    Stored {
        wrapped: RecordWrapper,
        previous: Option<RecordWrapper>,
    },
    Skipped(PutOutcome),
}

/// Order records by descending (`last_updated`, `last_accessed`).
pub fn sort_freshest_first<R: Freshness>(records: &mut [R]) {
    records.sort_by(|a, b| {
        (b.last_updated(), b.last_accessed()).cmp(&(a.last_updated(), a.last_accessed()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDht;
    use crate::{FreshnessValidator, NamespacedValidator, OpaqueValidator};
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Card {
        owner: String,
        note: String,
        updated: u64,
        accessed: u64,
    }

    impl Freshness for Card {
        fn last_updated(&self) -> u64 {
            self.updated
        }
        fn last_accessed(&self) -> u64 {
            self.accessed
        }
        fn matches_key(&self, key: &DirectoryKey) -> bool {
            key.logical() == self.owner
        }
        fn dedup_key(&self) -> String {
            self.owner.clone()
        }
    }

    fn card(note: &str, updated: u64, accessed: u64) -> Card {
        Card {
            owner: "p1".into(),
            note: note.into(),
            updated,
            accessed,
        }
    }

    fn validator() -> Arc<dyn Validator> {
        Arc::new(
            NamespacedValidator::new()
                .with("card", FreshnessValidator::<Card>::new())
                .with("strict-card", FreshnessValidator::<Card>::new())
                .with("block", OpaqueValidator),
        )
    }

    fn store_on(dht: &MemoryDht, name: &str, config: DirectoryConfig) -> DirectoryStore {
        let node = dht.join(name.parse().unwrap());
        DirectoryStore::new(Arc::new(node), validator(), config)
    }

    fn config() -> DirectoryConfig {
        DirectoryConfig::new().best_effort("card")
    }

    #[tokio::test]
    async fn put_then_get_across_nodes() {
        let dht = MemoryDht::new(validator());
        let a = store_on(&dht, "a", config());
        let b = store_on(&dht, "b", config());
        let key = DirectoryKey::new("card", "p1");

        let outcome = a.put_record(&key, &card("hi", 1, 1)).await.unwrap();
        assert_eq!(outcome, PutOutcome::Stored);
        let got: Card = b.get_record(&key).await.unwrap();
        assert_eq!(got.note, "hi");
    }

    #[tokio::test]
    async fn same_value_twice_is_unchanged() {
        let dht = MemoryDht::new(validator());
        let a = store_on(&dht, "a", config());
        let _b = store_on(&dht, "b", config());
        let key = DirectoryKey::new("card", "p1");

        a.put_record(&key, &card("hi", 1, 1)).await.unwrap();
        let first = a.get_local_wrapped(&key).unwrap();
        let outcome = a.put_record(&key, &card("hi", 1, 1)).await.unwrap();
        assert_eq!(outcome, PutOutcome::Unchanged);
        assert_eq!(a.get_local_wrapped(&key).unwrap(), first);
    }

    #[tokio::test]
    async fn older_put_is_silent_noop() {
        let dht = MemoryDht::new(validator());
        let a = store_on(&dht, "a", config());
        let _b = store_on(&dht, "b", config());
        let key = DirectoryKey::new("card", "p1");

        a.put_record(&key, &card("new", 5, 0)).await.unwrap();
        let outcome = a.put_record(&key, &card("old", 4, 9)).await.unwrap();
        assert_eq!(outcome, PutOutcome::KeptExisting);
        let local: Card = a.get_local_record(&key).unwrap();
        assert_eq!(local.note, "new");
    }

    #[tokio::test]
    async fn invalid_value_is_rejected_locally() {
        let dht = MemoryDht::new(validator());
        let a = store_on(&dht, "a", config());
        let key = DirectoryKey::new("card", "someone-else");

        let err = a.put_record(&key, &card("x", 1, 1)).await.unwrap_err();
        assert!(matches!(err, DirectoryError::Validation(_)));
        assert!(a.get_local(&key).is_none());
    }

    #[tokio::test]
    async fn best_effort_swallows_steady_state_errors() {
        let dht = MemoryDht::new(validator());
        let lonely = store_on(&dht, "a", config());
        let key = DirectoryKey::new("card", "p1");

        // No other node: NoPeersInRoutingTable is swallowed.
        let outcome = lonely.put_record(&key, &card("x", 1, 1)).await.unwrap();
        assert_eq!(outcome, PutOutcome::Stored);
        assert!(lonely.get_local(&key).is_some());
    }

    #[tokio::test]
    async fn strict_namespace_surfaces_steady_state_errors() {
        let dht = MemoryDht::new(validator());
        let a = store_on(&dht, "a", config());
        let key = DirectoryKey::new("strict-card", "p1");

        let err = a.put_record(&key, &card("x", 1, 1)).await.unwrap_err();
        assert!(matches!(err, DirectoryError::NoPeersInRoutingTable));
    }

    #[tokio::test]
    async fn failed_strict_put_leaves_no_local_trace_and_retries() {
        let dht = MemoryDht::new(validator());
        let a = store_on(&dht, "a", config());
        let key = DirectoryKey::new("strict-card", "p1");

        assert!(a.put_record(&key, &card("x", 1, 1)).await.is_err());
        assert!(a.get_local(&key).is_none());

        let b = store_on(&dht, "b", config());
        let outcome = a.put_record(&key, &card("x", 1, 1)).await.unwrap();
        assert_eq!(outcome, PutOutcome::Stored);
        let got: Card = b.get_record(&key).await.unwrap();
        assert_eq!(got.note, "x");
    }

    #[tokio::test]
    async fn failed_strict_put_restores_previous_local_value() {
        let dht = MemoryDht::new(validator());
        let a = store_on(&dht, "a", config());
        let key = DirectoryKey::new("strict-card", "p1");

        a.put_local(&key, serde_json::to_vec(&card("old", 1, 1)).unwrap())
            .unwrap();
        let before = a.get_local_wrapped(&key).unwrap();
        assert!(a.put_record(&key, &card("new", 2, 2)).await.is_err());
        assert_eq!(a.get_local_wrapped(&key).unwrap(), before);
    }

    #[tokio::test]
    async fn best_effort_swallows_stale_network_copy() {
        let dht = MemoryDht::new(validator());
        let a = store_on(&dht, "a", config());
        let _b = store_on(&dht, "b", config());
        let key = DirectoryKey::new("card", "p1");

        let newer = serde_json::to_vec(&card("newer", 9, 0)).unwrap();
        dht.plant(&"b".parse().unwrap(), &key, &RecordWrapper::new(newer.clone()));

        // `a` has no local copy, so it stores locally; the network says stale.
        let outcome = a.put_record(&key, &card("older", 1, 0)).await.unwrap();
        assert_eq!(outcome, PutOutcome::Stored);
        assert_eq!(a.get(&key).await.unwrap(), newer);
    }

    #[tokio::test]
    async fn get_all_drops_invalid_and_duplicate_replicas() {
        let dht = MemoryDht::new(validator());
        let a = store_on(&dht, "a", config());
        let _b = store_on(&dht, "b", config());
        let _c = store_on(&dht, "c", config());
        let key = DirectoryKey::new("card", "p1");

        let v1 = serde_json::to_vec(&card("one", 1, 0)).unwrap();
        let v2 = serde_json::to_vec(&card("two", 2, 0)).unwrap();
        dht.plant(&"b".parse().unwrap(), &key, &RecordWrapper::new(v1.clone()));
        dht.plant(&"c".parse().unwrap(), &key, &RecordWrapper::new(v2.clone()));
        dht.plant(&"a".parse().unwrap(), &key, &RecordWrapper::new(b"garbage".to_vec()));

        let mut all = a.get_all(&key).await.unwrap();
        all.sort();
        let mut expected = vec![v1, v2];
        expected.sort();
        assert_eq!(all, expected);
    }

    #[tokio::test]
    async fn merge_keeps_freshest_per_dedup_key() {
        let dht = MemoryDht::new(validator());
        let a = store_on(&dht, "a", config());
        let key = DirectoryKey::new("card", "p1");

        let old = serde_json::to_vec(&card("old", 1, 0)).unwrap();
        let new = serde_json::to_vec(&card("new", 2, 0)).unwrap();
        assert!(a.merge_local_entry(&key, "p1", new.clone()).unwrap());
        assert!(!a.merge_local_entry(&key, "p1", old).unwrap());
        assert_eq!(a.local_entries(&key), vec![new]);

        let taken = a.take_local_entries(&key);
        assert!(a.local_entries(&key).is_empty());
        a.restore_local_entries(&key, taken);
        assert_eq!(a.local_records::<Card>(&key)[0].note, "new");
    }

    struct StuckOverlay(PeerId);

    #[async_trait::async_trait]
    impl Overlay for StuckOverlay {
        fn local_peer(&self) -> &PeerId {
            &self.0
        }
        async fn put_value(&self, _: &DirectoryKey, _: Vec<u8>) -> Result<(), DirectoryError> {
            std::future::pending().await
        }
        async fn get_value(&self, _: &DirectoryKey) -> Result<Vec<u8>, DirectoryError> {
            std::future::pending().await
        }
        async fn search_value(&self, _: &DirectoryKey) -> Result<Vec<Vec<u8>>, DirectoryError> {
            std::future::pending().await
        }
        async fn get_closest_peers(&self, _: &DirectoryKey) -> Result<Vec<PeerId>, DirectoryError> {
            std::future::pending().await
        }
        async fn find_peer(&self, _: &PeerId) -> Result<PeerRoute, DirectoryError> {
            std::future::pending().await
        }
        async fn bootstrap(&self) -> Result<(), DirectoryError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn network_queries_are_deadline_bounded() {
        let store = DirectoryStore::new(
            Arc::new(StuckOverlay("a".parse().unwrap())),
            validator(),
            DirectoryConfig::new().query_timeout(Duration::from_millis(250)),
        );
        let key = DirectoryKey::new("block", "b1");

        let err = store.get(&key).await.unwrap_err();
        assert!(matches!(err, DirectoryError::Timeout { after } if after == Duration::from_millis(250)));
        assert!(store.find_peer(&"b".parse().unwrap()).await.is_err());

        // A timed-out write is undone even on a best-effort namespace.
        let err = store.put(&key, b"v".to_vec()).await.unwrap_err();
        assert!(matches!(err, DirectoryError::Timeout { .. }));
        assert!(store.get_local(&key).is_none());
    }
}
