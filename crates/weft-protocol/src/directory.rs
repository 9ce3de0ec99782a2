//! Directory records and the service that publishes and reads them.
//!
//! Two record kinds live in the directory:
//! - [`PeerClient`]: where a peer (or one of its logical clients) is
//!   currently attached, stored under the bare peer key and, when a client
//!   id is set, under a composite `{peer, client}` key,
//! - [`PeerEndpoint`]: a peer's own listen addresses and public keys.
//!
//! Records are never deleted. Disconnects mark them `Down` with a fresh
//! `last_updated`, so the newer state wins everywhere it replicates.
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use weft_dht::{
    namespace, now_ms, DirectoryKey, DirectoryStore, Freshness, FreshnessValidator,
    NamespacedValidator, OpaqueValidator,
};
use weft_transport::{PeerId, SessionId};

use crate::crypto;
use crate::identity::PeerKeys;
use crate::reconcile::Reconciler;
use crate::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Active,
    Down,
}

// ── PeerClient ───────────────────────────────────────────────────────

/// Current attachment point of a peer's client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerClient {
    pub peer_id: PeerId,
    /// Empty when the record describes the peer as a whole.
    #[serde(default)]
    pub client_id: String,
    pub connect_peer_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_session_id: Option<SessionId>,
    #[serde(default)]
    pub connect_address: String,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_public_key: Option<String>,
    pub status: PeerStatus,
    pub last_updated: u64,
    pub last_accessed: u64,
}

impl PeerClient {
    /// A freshly attached, active record.
    pub fn attached(
        peer_id: PeerId,
        client_id: impl Into<String>,
        connect_peer_id: PeerId,
        keys: &PeerKeys,
    ) -> Self {
        let now = now_ms();
        Self {
            peer_id,
            client_id: client_id.into(),
            connect_peer_id,
            connect_session_id: None,
            connect_address: String::new(),
            public_key: crypto::encode_key(&keys.current),
            previous_public_key: keys.previous.as_ref().map(crypto::encode_key),
            status: PeerStatus::Active,
            last_updated: now,
            last_accessed: now,
        }
    }

    pub fn with_session(mut self, session: SessionId) -> Self {
        self.connect_session_id = Some(session);
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.connect_address = address.into();
        self
    }

    /// Key holding every client record of `peer`.
    pub fn peer_key(peer: &PeerId) -> DirectoryKey {
        DirectoryKey::new(namespace::PEER_CLIENT, peer.as_str())
    }

    /// Secondary key for one client of `peer`.
    pub fn client_key(peer: &PeerId, client_id: &str) -> DirectoryKey {
        let mut fields = BTreeMap::new();
        fields.insert("peer".to_string(), peer.to_string());
        fields.insert("client".to_string(), client_id.to_string());
        DirectoryKey::composite(namespace::PEER_CLIENT, &fields)
    }

    /// The key to query for `peer` and optionally one of its clients.
    pub fn lookup_key(peer: &PeerId, client_id: Option<&str>) -> DirectoryKey {
        match client_id {
            Some(client) if !client.is_empty() => Self::client_key(peer, client),
            _ => Self::peer_key(peer),
        }
    }

    /// Every key this record is published under.
    pub fn keys(&self) -> Vec<DirectoryKey> {
        let mut keys = vec![Self::peer_key(&self.peer_id)];
        if !self.client_id.is_empty() {
            keys.push(Self::client_key(&self.peer_id, &self.client_id));
        }
        keys
    }

    pub fn is_active(&self) -> bool {
        self.status == PeerStatus::Active
    }

    /// Liveness check answered.
    pub fn touch(&mut self, now: u64) {
        self.last_accessed = now;
    }

    /// The client re-attached somewhere else.
    pub fn move_to(
        &mut self,
        connect_peer_id: PeerId,
        session: Option<SessionId>,
        address: impl Into<String>,
        now: u64,
    ) {
        self.connect_peer_id = connect_peer_id;
        self.connect_session_id = session;
        self.connect_address = address.into();
        self.status = PeerStatus::Active;
        self.last_updated = now;
        self.last_accessed = now;
    }

    pub fn mark_down(&mut self, now: u64) {
        self.status = PeerStatus::Down;
        self.last_updated = now;
    }

    pub fn peer_keys(&self) -> Result<PeerKeys, ProtocolError> {
        decode_keys(&self.public_key, self.previous_public_key.as_deref())
    }
}

impl Freshness for PeerClient {
    fn last_updated(&self) -> u64 {
        self.last_updated
    }

    fn last_accessed(&self) -> u64 {
        self.last_accessed
    }

    fn matches_key(&self, key: &DirectoryKey) -> bool {
        match key.composite_fields() {
            Some(fields) => {
                fields.get("peer").map(String::as_str) == Some(self.peer_id.as_str())
                    && fields.get("client") == Some(&self.client_id)
            }
            None => key.logical() == self.peer_id.as_str(),
        }
    }

    fn dedup_key(&self) -> String {
        format!("{}/{}", self.peer_id, self.client_id)
    }
}

// ── PeerEndpoint ─────────────────────────────────────────────────────

/// A peer's own reachability and keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEndpoint {
    pub peer_id: PeerId,
    #[serde(default)]
    pub addresses: Vec<String>,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_public_key: Option<String>,
    pub status: PeerStatus,
    pub last_updated: u64,
    pub last_accessed: u64,
}

impl PeerEndpoint {
    pub fn new(peer_id: PeerId, keys: &PeerKeys, addresses: Vec<String>) -> Self {
        let now = now_ms();
        Self {
            peer_id,
            addresses,
            public_key: crypto::encode_key(&keys.current),
            previous_public_key: keys.previous.as_ref().map(crypto::encode_key),
            status: PeerStatus::Active,
            last_updated: now,
            last_accessed: now,
        }
    }

    pub fn key(peer: &PeerId) -> DirectoryKey {
        DirectoryKey::new(namespace::PEER_ENDPOINT, peer.as_str())
    }

    pub fn is_active(&self) -> bool {
        self.status == PeerStatus::Active
    }

    pub fn touch(&mut self, now: u64) {
        self.last_accessed = now;
    }

    pub fn mark_down(&mut self, now: u64) {
        self.status = PeerStatus::Down;
        self.last_updated = now;
    }

    pub fn peer_keys(&self) -> Result<PeerKeys, ProtocolError> {
        decode_keys(&self.public_key, self.previous_public_key.as_deref())
    }
}

impl Freshness for PeerEndpoint {
    fn last_updated(&self) -> u64 {
        self.last_updated
    }

    fn last_accessed(&self) -> u64 {
        self.last_accessed
    }

    fn matches_key(&self, key: &DirectoryKey) -> bool {
        key.logical() == self.peer_id.as_str()
    }

    fn dedup_key(&self) -> String {
        self.peer_id.to_string()
    }
}

fn decode_keys(current: &str, previous: Option<&str>) -> Result<PeerKeys, ProtocolError> {
    Ok(PeerKeys {
        current: crypto::decode_key(current)?,
        previous: previous.map(crypto::decode_key).transpose()?,
    })
}

/// Validators for every namespace this fabric writes.
pub fn directory_validator() -> NamespacedValidator {
    NamespacedValidator::new()
        .with(namespace::PEER_CLIENT, FreshnessValidator::<PeerClient>::new())
        .with(namespace::PEER_ENDPOINT, FreshnessValidator::<PeerEndpoint>::new())
        .with(namespace::BLOCK, OpaqueValidator)
        .with(namespace::TRANSACTION, OpaqueValidator)
}

// ── Directory service ────────────────────────────────────────────────

/// Publishes and reads directory records, and notices peers coming up.
///
/// Every record that passes through is observed: an `Active` record newer
/// than the last state seen for that peer, after a `Down` state (or for a
/// peer never seen before), is reported on the activity channel. The
/// runtime turns those reports into mailbox redelivery.
pub struct Directory {
    store: Arc<DirectoryStore>,
    reconciler: Reconciler,
    liveness: Mutex<HashMap<PeerId, (PeerStatus, u64)>>,
    activity: Option<mpsc::UnboundedSender<PeerId>>,
}

impl Directory {
    pub fn new(store: Arc<DirectoryStore>) -> Self {
        Self {
            reconciler: Reconciler::new(store.clone()),
            store,
            liveness: Mutex::new(HashMap::new()),
            activity: None,
        }
    }

    pub fn with_activity(mut self, activity: mpsc::UnboundedSender<PeerId>) -> Self {
        self.activity = Some(activity);
        self
    }

    pub fn store(&self) -> &Arc<DirectoryStore> {
        &self.store
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn local_peer(&self) -> &PeerId {
        self.store.local_peer()
    }

    /// Write a client record under all its keys, locally and to the network.
    pub async fn publish_client(&self, record: &PeerClient) -> Result<(), ProtocolError> {
        let value = serde_json::to_vec(record)?;
        let keys = record.keys();
        for key in &keys {
            self.store
                .merge_local_entry(key, record.dedup_key(), value.clone())?;
        }
        self.observe(&record.peer_id, record.status, record.last_updated);

        for key in &keys {
            self.store.put(key, value.clone()).await?;
        }
        tracing::debug!(
            "directory: published {} via {} ({:?})",
            record.dedup_key(),
            record.connect_peer_id,
            record.status
        );
        Ok(())
    }

    pub async fn publish_endpoint(&self, record: &PeerEndpoint) -> Result<(), ProtocolError> {
        self.observe(&record.peer_id, record.status, record.last_updated);
        self.store
            .put_record(&PeerEndpoint::key(&record.peer_id), record)
            .await?;
        Ok(())
    }

    /// Client records for `peer` held locally, freshest first.
    pub fn local_clients(&self, peer: &PeerId, client_id: Option<&str>) -> Vec<PeerClient> {
        self.store
            .local_records(&PeerClient::lookup_key(peer, client_id))
    }

    /// Client records for `peer` at the namespace's configured fault
    /// tolerance level, freshest first.
    pub async fn clients(
        &self,
        peer: &PeerId,
        client_id: Option<&str>,
    ) -> Result<Vec<PeerClient>, ProtocolError> {
        let key = PeerClient::lookup_key(peer, client_id);
        let records: Vec<PeerClient> = self.reconciler.resolve_configured(&key).await?;
        for record in &records {
            self.observe(&record.peer_id, record.status, record.last_updated);
        }
        Ok(records)
    }

    /// The endpoint record of `peer`, from the network or else the local copy.
    pub async fn endpoint(&self, peer: &PeerId) -> Result<PeerEndpoint, ProtocolError> {
        let key = PeerEndpoint::key(peer);
        let record = match self.store.get_record::<PeerEndpoint>(&key).await {
            Ok(record) => {
                if let Ok(value) = serde_json::to_vec(&record) {
                    if let Err(e) = self.store.put_local(&key, value) {
                        tracing::debug!("directory: could not cache endpoint of {peer}: {e}");
                    }
                }
                record
            }
            Err(e) => match self.store.get_local_record::<PeerEndpoint>(&key) {
                Some(local) => {
                    tracing::debug!("directory: endpoint of {peer} served locally: {e}");
                    local
                }
                None => return Err(e.into()),
            },
        };
        self.observe(&record.peer_id, record.status, record.last_updated);
        Ok(record)
    }

    /// Mark every known client attached through `peer`, and `peer`'s own
    /// endpoint, as down. Returns how many records changed.
    pub async fn mark_peer_down(&self, peer: &PeerId) -> usize {
        let now = now_ms();
        let mut changed: Vec<PeerClient> = Vec::new();

        for key in self.store.local_keys(namespace::PEER_CLIENT) {
            for mut record in self.store.local_records::<PeerClient>(&key) {
                if &record.connect_peer_id != peer || !record.is_active() {
                    continue;
                }
                record.mark_down(now);
                match serde_json::to_vec(&record) {
                    Ok(value) => {
                        if let Err(e) = self.store.merge_local_entry(&key, record.dedup_key(), value) {
                            tracing::warn!("directory: mark down {} failed: {e}", record.dedup_key());
                            continue;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("directory: encode {} failed: {e}", record.dedup_key());
                        continue;
                    }
                }
                if !changed.iter().any(|r| r.dedup_key() == record.dedup_key()) {
                    changed.push(record);
                }
            }
        }

        for record in &changed {
            self.note_unreachable(&record.peer_id);
            for key in record.keys() {
                if let Err(e) = self.store.put_record(&key, record).await {
                    tracing::debug!("directory: down state of {} kept local: {e}", record.dedup_key());
                }
            }
        }

        let mut count = changed.len();
        let endpoint_key = PeerEndpoint::key(peer);
        if let Some(mut endpoint) = self.store.get_local_record::<PeerEndpoint>(&endpoint_key) {
            if endpoint.is_active() {
                endpoint.mark_down(now);
                if let Err(e) = self.store.put_record(&endpoint_key, &endpoint).await {
                    tracing::debug!("directory: down state of endpoint {peer} kept local: {e}");
                }
                count += 1;
            }
        }
        self.note_unreachable(peer);

        if count > 0 {
            tracing::info!("directory: marked {count} record(s) down after {peer} disconnected");
        }
        count
    }

    /// Delivery to `peer` just failed. Only a record newer than what we
    /// have already seen will report it active again.
    pub fn note_unreachable(&self, peer: &PeerId) {
        let mut liveness = self.liveness.lock().unwrap_or_else(|p| p.into_inner());
        let updated = liveness.get(peer).map(|(_, t)| *t).unwrap_or(0);
        liveness.insert(peer.clone(), (PeerStatus::Down, updated));
    }

    fn observe(&self, peer: &PeerId, status: PeerStatus, updated: u64) {
        let came_up = {
            let mut liveness = self.liveness.lock().unwrap_or_else(|p| p.into_inner());
            match liveness.get(peer).copied() {
                Some((_, seen)) if updated <= seen => false,
                previous => {
                    liveness.insert(peer.clone(), (status, updated));
                    status == PeerStatus::Active
                        && !matches!(previous, Some((PeerStatus::Active, _)))
                }
            }
        };
        if came_up && self.store.local_peer() != peer {
            if let Some(activity) = &self.activity {
                tracing::debug!("directory: {peer} is active");
                let _ = activity.send(peer.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_dht::memory::MemoryDht;
    use weft_dht::{DirectoryConfig, Validator};

    fn peer(name: &str) -> PeerId {
        name.parse().unwrap()
    }

    fn keys(byte: u8) -> PeerKeys {
        crate::Identity::from_seed(peer("k"), [byte; 32]).keys()
    }

    fn validator() -> Arc<dyn Validator> {
        Arc::new(directory_validator())
    }

    fn directory_on(dht: &MemoryDht, name: &str) -> Directory {
        let store = DirectoryStore::new(
            Arc::new(dht.join(peer(name))),
            validator(),
            DirectoryConfig::new(),
        );
        Directory::new(Arc::new(store))
    }

    #[test]
    fn client_record_matches_both_keys() {
        let record = PeerClient::attached(peer("b"), "app", peer("c"), &keys(1));
        let keys = record.keys();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| record.matches_key(k)));
        assert!(!record.matches_key(&PeerClient::peer_key(&peer("x"))));
        assert!(!record.matches_key(&PeerClient::client_key(&peer("b"), "other")));
        assert_eq!(record.dedup_key(), "b/app");
    }

    #[test]
    fn bare_client_record_has_one_key() {
        let record = PeerClient::attached(peer("b"), "", peer("b"), &keys(1));
        assert_eq!(record.keys(), vec![PeerClient::peer_key(&peer("b"))]);
        assert_eq!(
            PeerClient::lookup_key(&peer("b"), Some("")),
            PeerClient::peer_key(&peer("b"))
        );
    }

    #[test]
    fn move_and_mark_down_bump_last_updated() {
        let mut record = PeerClient::attached(peer("b"), "app", peer("c"), &keys(1));
        record.touch(record.last_updated + 5);
        assert_eq!(record.last_accessed, record.last_updated + 5);

        let later = record.last_updated + 10;
        record.move_to(peer("d"), Some(SessionId::from("s1")), "mem://d", later);
        assert_eq!(record.connect_peer_id, peer("d"));
        assert_eq!(record.last_updated, later);

        record.mark_down(later + 1);
        assert!(!record.is_active());
        assert_eq!(record.last_updated, later + 1);
    }

    #[test]
    fn record_keys_decode() {
        let mut id = crate::Identity::from_seed(peer("b"), [3u8; 32]);
        id.rotate();
        let record = PeerClient::attached(peer("b"), "", peer("b"), &id.keys());
        assert_eq!(record.peer_keys().unwrap(), id.keys());
    }

    #[test]
    fn status_serializes_lowercase() {
        let record = PeerEndpoint::new(peer("b"), &keys(2), vec!["mem://b".into()]);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "active");
        assert!(json.get("previous_public_key").is_none());
    }

    #[test]
    fn validator_rejects_misfiled_records() {
        let record = PeerClient::attached(peer("b"), "app", peer("c"), &keys(1));
        let value = serde_json::to_vec(&record).unwrap();
        let v = directory_validator();
        assert!(v.validate(&PeerClient::peer_key(&peer("b")), &value).is_ok());
        assert!(v.validate(&PeerClient::peer_key(&peer("z")), &value).is_err());
        assert!(v.validate(&PeerEndpoint::key(&peer("b")), &value).is_err());
    }

    #[tokio::test]
    async fn publish_then_read_from_another_node() {
        let dht = MemoryDht::new(validator());
        let a = directory_on(&dht, "a");
        let b = directory_on(&dht, "b");
        let record = PeerClient::attached(peer("b"), "app", peer("b"), &keys(1));
        b.publish_client(&record).await.unwrap();

        let found = a.clients(&peer("b"), Some("app")).await.unwrap();
        assert_eq!(found, vec![record.clone()]);
        let found = a.clients(&peer("b"), None).await.unwrap();
        assert_eq!(found, vec![record]);
    }

    #[tokio::test]
    async fn mark_peer_down_only_touches_that_connect_peer() {
        let dht = MemoryDht::new(validator());
        let a = directory_on(&dht, "a");
        let _b = directory_on(&dht, "b");
        let via_c = PeerClient::attached(peer("x"), "app", peer("c"), &keys(1));
        let via_d = PeerClient::attached(peer("y"), "app", peer("d"), &keys(2));
        a.publish_client(&via_c).await.unwrap();
        a.publish_client(&via_d).await.unwrap();

        assert_eq!(a.mark_peer_down(&peer("c")).await, 1);
        assert!(!a.local_clients(&peer("x"), None)[0].is_active());
        assert!(a.local_clients(&peer("y"), None)[0].is_active());
        assert_eq!(a.mark_peer_down(&peer("c")).await, 0);
    }

    #[tokio::test]
    async fn activity_fires_on_newer_active_record() {
        let dht = MemoryDht::new(validator());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let a = directory_on(&dht, "a").with_activity(tx);
        let _b = directory_on(&dht, "b");

        let mut record = PeerClient::attached(peer("x"), "", peer("c"), &keys(1));
        a.publish_client(&record).await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), peer("x"));

        // Same state again: no transition.
        a.clients(&peer("x"), None).await.unwrap();
        assert!(rx.try_recv().is_err());

        a.note_unreachable(&peer("x"));
        a.clients(&peer("x"), None).await.unwrap();
        assert!(rx.try_recv().is_err(), "stale record must not revive a peer");

        record.move_to(peer("d"), None, "", record.last_updated + 1);
        a.publish_client(&record).await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), peer("x"));
    }

    #[tokio::test]
    async fn endpoint_falls_back_to_local_copy() {
        let dht = MemoryDht::new(validator());
        let a = directory_on(&dht, "a");
        let _b = directory_on(&dht, "b");
        let endpoint = PeerEndpoint::new(peer("a"), &keys(4), vec![]);
        a.publish_endpoint(&endpoint).await.unwrap();

        dht.set_online(&peer("a"), false);
        assert_eq!(a.endpoint(&peer("a")).await.unwrap(), endpoint);
        assert!(a.endpoint(&peer("nobody")).await.is_err());
    }
}
