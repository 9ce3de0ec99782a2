//! In-process DHT: a set of nodes sharing one key space.
//!
//! Node positions and key positions are SHA-256 hashes; "closest" is XOR
//! distance. A put lands on the `k` closest online nodes other than the
//! writer, and each node enforces validate + select on its own copy, so an
//! older write against a newer replica fails with `StaleValue`.
//!
//! Tests shape the network with [`MemoryDht::set_online`],
//! [`MemoryDht::set_route`] and [`MemoryDht::plant`].
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use sha2::{Digest, Sha256};
use weft_transport::PeerId;

use crate::{DirectoryError, DirectoryKey, Overlay, PeerRoute, RecordWrapper, Validator};

/// Default replication factor.
pub const DEFAULT_REPLICATION: usize = 3;

struct DhtNode {
    position: [u8; 32],
    online: bool,
    store: HashMap<DirectoryKey, Vec<u8>>,
    relay: Option<PeerId>,
    addresses: Vec<String>,
}

impl DhtNode {
    fn new(peer: &PeerId) -> Self {
        Self {
            position: Sha256::digest(peer.as_str().as_bytes()).into(),
            online: true,
            store: HashMap::new(),
            relay: None,
            addresses: Vec::new(),
        }
    }

    /// Apply a wrapped value to this node's replica.
    fn accept(
        &mut self,
        validator: &dyn Validator,
        key: &DirectoryKey,
        wrapped: &[u8],
    ) -> Result<(), DirectoryError> {
        let incoming = RecordWrapper::decode(wrapped)?;
        validator.validate(key, &incoming.value)?;

        if let Some(existing) = self.store.get(key) {
            let existing = RecordWrapper::decode(existing)?;
            if existing.value == incoming.value {
                return Ok(());
            }
            let winner = validator.select(key, &[&existing.value, &incoming.value])?;
            if winner == 0 {
                return Err(DirectoryError::StaleValue);
            }
        }
        self.store.insert(key.clone(), wrapped.to_vec());
        Ok(())
    }
}

struct DhtState {
    nodes: BTreeMap<PeerId, DhtNode>,
}

/// Shared in-memory DHT. Clone to share.
#[derive(Clone)]
pub struct MemoryDht {
    state: Arc<Mutex<DhtState>>,
    validator: Arc<dyn Validator>,
    replication: usize,
}

impl MemoryDht {
    pub fn new(validator: Arc<dyn Validator>) -> Self {
        Self::with_replication(validator, DEFAULT_REPLICATION)
    }

    pub fn with_replication(validator: Arc<dyn Validator>, replication: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(DhtState {
                nodes: BTreeMap::new(),
            })),
            validator,
            replication: replication.max(1),
        }
    }

    /// Add a node and return its overlay handle.
    pub fn join(&self, peer: PeerId) -> MemoryDhtNode {
        self.lock()
            .nodes
            .entry(peer.clone())
            .or_insert_with(|| DhtNode::new(&peer));
        MemoryDhtNode {
            local: peer,
            dht: self.clone(),
        }
    }

    pub fn set_online(&self, peer: &PeerId, online: bool) {
        if let Some(node) = self.lock().nodes.get_mut(peer) {
            node.online = online;
        }
    }

    /// Advertise `peer` as reachable through `relay` (or directly with `None`).
    pub fn set_route(&self, peer: &PeerId, relay: Option<PeerId>, addresses: Vec<String>) {
        if let Some(node) = self.lock().nodes.get_mut(peer) {
            node.relay = relay;
            node.addresses = addresses;
        }
    }

    /// Force a wrapped value onto one node, skipping validation and select.
    /// Used to stage divergent replicas.
    pub fn plant(&self, peer: &PeerId, key: &DirectoryKey, record: &RecordWrapper) {
        if let Some(node) = self.lock().nodes.get_mut(peer) {
            node.store.insert(key.clone(), record.encode());
        }
    }

    /// Nodes currently holding a replica of `key`.
    pub fn holders(&self, key: &DirectoryKey) -> Vec<PeerId> {
        self.lock()
            .nodes
            .iter()
            .filter(|(_, node)| node.store.contains_key(key))
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, DhtState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Online nodes other than `exclude`, closest to `target` first, at most `k`.
    fn closest(state: &DhtState, target: &[u8; 32], exclude: &PeerId, k: usize) -> Vec<PeerId> {
        let mut ranked: Vec<([u8; 32], &PeerId)> = state
            .nodes
            .iter()
            .filter(|(peer, node)| node.online && *peer != exclude)
            .map(|(peer, node)| (xor_distance(&node.position, target), peer))
            .collect();
        ranked.sort();
        ranked.into_iter().take(k).map(|(_, p)| p.clone()).collect()
    }
}

fn xor_distance(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

/// One node's view of a [`MemoryDht`].
#[derive(Clone)]
pub struct MemoryDhtNode {
    local: PeerId,
    dht: MemoryDht,
}

impl MemoryDhtNode {
    fn ensure_online(&self, state: &DhtState) -> Result<(), DirectoryError> {
        match state.nodes.get(&self.local) {
            Some(node) if node.online => Ok(()),
            _ => Err(DirectoryError::NoPeersInRoutingTable),
        }
    }

    /// Replicas of `key` on the local node and its `k` closest peers.
    fn collect(&self, key: &DirectoryKey) -> Result<Vec<Vec<u8>>, DirectoryError> {
        let state = self.dht.lock();
        self.ensure_online(&state)?;
        let peers = MemoryDht::closest(&state, &key.hash(), &self.local, self.dht.replication);

        let mut found = Vec::new();
        for peer in std::iter::once(&self.local).chain(peers.iter()) {
            if let Some(value) = state.nodes.get(peer).and_then(|n| n.store.get(key)) {
                found.push(value.clone());
            }
        }
        if found.is_empty() {
            if peers.is_empty() {
                return Err(DirectoryError::NoPeersInRoutingTable);
            }
            return Err(DirectoryError::NotFound {
                key: key.to_string(),
            });
        }
        Ok(found)
    }
}

#[async_trait::async_trait]
impl Overlay for MemoryDhtNode {
    fn local_peer(&self) -> &PeerId {
        &self.local
    }

    async fn put_value(&self, key: &DirectoryKey, value: Vec<u8>) -> Result<(), DirectoryError> {
        let mut state = self.dht.lock();
        self.ensure_online(&state)?;
        let peers = MemoryDht::closest(&state, &key.hash(), &self.local, self.dht.replication);
        if peers.is_empty() {
            return Err(DirectoryError::NoPeersInRoutingTable);
        }

        let mut stored = 0;
        let mut last_err = None;
        for peer in &peers {
            let Some(node) = state.nodes.get_mut(peer) else {
                continue;
            };
            match node.accept(self.dht.validator.as_ref(), key, &value) {
                Ok(()) => stored += 1,
                Err(e @ DirectoryError::Validation(_)) => return Err(e),
                Err(e) => {
                    tracing::debug!("dht: {peer} refused {key}: {e}");
                    last_err = Some(e);
                }
            }
        }

        match (stored, last_err) {
            (0, Some(e)) => Err(e),
            _ => Ok(()),
        }
    }

    async fn get_value(&self, key: &DirectoryKey) -> Result<Vec<u8>, DirectoryError> {
        let found = self.collect(key)?;
        let inner: Vec<RecordWrapper> = found
            .iter()
            .filter_map(|raw| RecordWrapper::decode(raw).ok())
            .collect();
        let candidates: Vec<&[u8]> = inner.iter().map(|w| w.value.as_slice()).collect();
        if candidates.is_empty() {
            return Err(DirectoryError::NotFound {
                key: key.to_string(),
            });
        }
        let best = self.dht.validator.select(key, &candidates)?;
        Ok(inner[best].encode())
    }

    async fn search_value(&self, key: &DirectoryKey) -> Result<Vec<Vec<u8>>, DirectoryError> {
        self.collect(key)
    }

    async fn get_closest_peers(&self, key: &DirectoryKey) -> Result<Vec<PeerId>, DirectoryError> {
        let state = self.dht.lock();
        self.ensure_online(&state)?;
        let peers = MemoryDht::closest(&state, &key.hash(), &self.local, self.dht.replication);
        if peers.is_empty() {
            return Err(DirectoryError::NoPeersInRoutingTable);
        }
        Ok(peers)
    }

    async fn find_peer(&self, peer: &PeerId) -> Result<PeerRoute, DirectoryError> {
        let state = self.dht.lock();
        self.ensure_online(&state)?;
        match state.nodes.get(peer) {
            Some(node) if node.online => Ok(PeerRoute {
                peer: peer.clone(),
                connect_peer: node.relay.clone().unwrap_or_else(|| peer.clone()),
                addresses: node.addresses.clone(),
            }),
            _ => Err(DirectoryError::NotFound {
                key: peer.to_string(),
            }),
        }
    }

    async fn bootstrap(&self) -> Result<(), DirectoryError> {
        let state = self.dht.lock();
        self.ensure_online(&state)?;
        let others = state
            .nodes
            .iter()
            .any(|(p, n)| n.online && *p != self.local);
        if !others {
            return Err(DirectoryError::NoPeersInRoutingTable);
        }
        tracing::debug!("dht: {} bootstrapped", self.local);
        Ok(())
    }
}
