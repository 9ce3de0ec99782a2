//! The node's own identity.
//!
//! One explicit `Identity` value is handed to every service that needs to
//! answer "is this me?" or sign something. There is no process-wide self.
use chacha20poly1305::aead::rand_core::{OsRng, RngCore};
use ed25519_dalek::SigningKey;
use weft_transport::PeerId;

/// Who this node is, and the keys it signs and decrypts with.
#[derive(Clone)]
pub struct Identity {
    peer_id: PeerId,
    current: SigningKey,
    /// Kept after a rotation so messages sealed for the old key still open.
    previous: Option<SigningKey>,
    address: String,
}

/// Public keys of a remote peer, as published in the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerKeys {
    pub current: [u8; 32],
    pub previous: Option<[u8; 32]>,
}

fn random_seed() -> [u8; 32] {
    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    seed
}

impl Identity {
    /// Fresh random signing key.
    pub fn generate(peer_id: PeerId) -> Self {
        Self::from_seed(peer_id, random_seed())
    }

    /// Deterministic identity from a 32-byte Ed25519 seed.
    pub fn from_seed(peer_id: PeerId, seed: [u8; 32]) -> Self {
        Self {
            peer_id,
            current: SigningKey::from_bytes(&seed),
            previous: None,
            address: String::new(),
        }
    }

    /// Listen address advertised in directory records.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Replace the signing key. The old one becomes `previous`.
    pub fn rotate(&mut self) {
        let fresh = SigningKey::from_bytes(&random_seed());
        let old = std::mem::replace(&mut self.current, fresh);
        self.previous = Some(old);
        tracing::info!("identity: rotated signing key for {}", self.peer_id);
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_self(&self, peer: &PeerId) -> bool {
        &self.peer_id == peer
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.current.verifying_key().to_bytes()
    }

    pub fn previous_public_key(&self) -> Option<[u8; 32]> {
        self.previous.as_ref().map(|k| k.verifying_key().to_bytes())
    }

    pub fn keys(&self) -> PeerKeys {
        PeerKeys {
            current: self.public_key(),
            previous: self.previous_public_key(),
        }
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.current
    }

    pub(crate) fn previous_signing_key(&self) -> Option<&SigningKey> {
        self.previous.as_ref()
    }

    /// Secret seeds to try when unwrapping, current first.
    pub(crate) fn seeds(&self) -> Vec<[u8; 32]> {
        std::iter::once(&self.current)
            .chain(self.previous.as_ref())
            .map(|k| k.to_bytes())
            .collect()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("peer_id", &self.peer_id)
            .field("rotated", &self.previous.is_some())
            .field("address", &self.address)
            .finish()
    }
}
