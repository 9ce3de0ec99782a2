//! Security envelope: sign, encrypt, compress and their inverses.
//!
//! Applied exactly once at each end. `encrypt` only acts on envelopes this
//! node originated that still carry a decoded payload, and `decrypt` only
//! on envelopes that still carry wire bytes, so relaying an envelope
//! through any number of hops never touches its ciphertext.
//!
//! Outbound order: serialize, sign the plaintext, seal with a fresh key,
//! wrap that key for the recipient, compress if large, base64.
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, RwLock};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use weft_transport::PeerId;

use crate::crypto::{self, WrappedKey};
use crate::identity::{Identity, PeerKeys};
use crate::payload::Payload;
use crate::{Envelope, ProtocolError};

/// Payloads at or below this size are never compressed.
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 2048;

/// Upper bound for an inflated payload.
const MAX_INFLATED: usize = 16 * 1024 * 1024;

/// Looks up the public keys of a peer.
#[async_trait::async_trait]
pub trait KeyResolver: Send + Sync {
    async fn keys(&self, peer: &PeerId) -> Result<PeerKeys, ProtocolError>;
}

/// Fixed key table.
#[derive(Default)]
pub struct StaticKeys {
    keys: RwLock<HashMap<PeerId, PeerKeys>>,
}

impl StaticKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, peer: PeerId, keys: PeerKeys) {
        self.keys
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(peer, keys);
    }
}

#[async_trait::async_trait]
impl KeyResolver for StaticKeys {
    async fn keys(&self, peer: &PeerId) -> Result<PeerKeys, ProtocolError> {
        self.keys
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(peer)
            .copied()
            .ok_or_else(|| ProtocolError::Security(format!("no public key known for {peer}")))
    }
}

pub struct SecurityEnvelope {
    identity: Identity,
    keys: Arc<dyn KeyResolver>,
    compress_threshold: usize,
}

impl SecurityEnvelope {
    pub fn new(identity: Identity, keys: Arc<dyn KeyResolver>) -> Self {
        Self {
            identity,
            keys,
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
        }
    }

    pub fn with_compress_threshold(mut self, bytes: usize) -> Self {
        self.compress_threshold = bytes;
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Turn the decoded payload into wire bytes.
    pub async fn encrypt(&self, env: &mut Envelope) -> Result<(), ProtocolError> {
        if env.src_peer_id.as_ref() != Some(self.identity.peer_id()) {
            return Ok(());
        }
        let Some(payload) = env.payload.as_ref() else {
            return Ok(());
        };
        let plain = payload.to_bytes()?;
        env.payload_type = payload.type_tag().to_string();

        let mut bytes = plain;
        if env.need_encrypt {
            let target = match (&env.target_peer_id, env.has_topic()) {
                (Some(target), false) => target.clone(),
                _ => {
                    return Err(ProtocolError::Validation(
                        "encryption needs a single unicast target".into(),
                    ))
                }
            };
            let recipient = self.keys.keys(&target).await?;

            env.payload_signature = crypto::sign(self.identity.signing_key(), &bytes);
            env.previous_key_payload_signature = self
                .identity
                .previous_signing_key()
                .map(|k| crypto::sign(k, &bytes))
                .unwrap_or_default();

            let key = crypto::fresh_key();
            bytes = crypto::seal(&key, &bytes)?;
            env.payload_key = crypto::wrap_key(&key, &recipient.current)?.to_bytes()?;
        }

        if env.need_compress && bytes.len() > self.compress_threshold {
            bytes = compress(&bytes)?;
        } else {
            env.need_compress = false;
        }

        env.transport_payload = STANDARD.encode(&bytes);
        env.payload = None;
        Ok(())
    }

    /// Turn wire bytes back into a decoded payload.
    pub async fn decrypt(&self, env: &mut Envelope) -> Result<(), ProtocolError> {
        if env.transport_payload.is_empty() {
            return Ok(());
        }
        let mut bytes = STANDARD
            .decode(&env.transport_payload)
            .map_err(|e| ProtocolError::Validation(format!("transport payload is not base64: {e}")))?;

        if env.need_compress {
            bytes = decompress(&bytes)?;
        }

        if env.need_encrypt {
            let wrapped = WrappedKey::from_bytes(&env.payload_key)?;
            let key = self.unwrap_key(&wrapped)?;
            bytes = crypto::open(&key, &bytes)?;

            let sender = env
                .src_peer_id
                .as_ref()
                .ok_or_else(|| ProtocolError::Security("encrypted payload without sender".into()))?;
            let keys = self.keys.keys(sender).await?;
            verify_signatures(&keys, &bytes, env)?;
        }

        env.payload = Some(Payload::from_bytes(&env.payload_type, &bytes)?);
        env.transport_payload.clear();
        Ok(())
    }

    /// Current key first, then the one it replaced.
    fn unwrap_key(&self, wrapped: &WrappedKey) -> Result<[u8; 32], ProtocolError> {
        let mut last_err = None;
        for seed in self.identity.seeds() {
            match crypto::unwrap_key(wrapped, &seed) {
                Ok(key) => return Ok(key),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| ProtocolError::Security("no local key".into())))
    }
}

fn verify_signatures(keys: &PeerKeys, plain: &[u8], env: &Envelope) -> Result<(), ProtocolError> {
    if crypto::verify(&keys.current, plain, &env.payload_signature) {
        return Ok(());
    }
    // Sender rotated and we still know it by its old key.
    if !env.previous_key_payload_signature.is_empty()
        && crypto::verify(&keys.current, plain, &env.previous_key_payload_signature)
    {
        return Ok(());
    }
    // We know the rotation, the sender signed with its old key.
    if let Some(previous) = keys.previous {
        if crypto::verify(&previous, plain, &env.payload_signature) {
            return Ok(());
        }
    }
    Err(ProtocolError::Security("payload signature mismatch".into()))
}

fn compress(bytes: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let failed = |e: std::io::Error| ProtocolError::Serialization(format!("compression failed: {e}"));
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).map_err(failed)?;
    encoder.finish().map_err(failed)
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::new();
    ZlibDecoder::new(bytes)
        .take(MAX_INFLATED as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::Validation(format!("payload does not inflate: {e}")))?;
    if out.len() > MAX_INFLATED {
        return Err(ProtocolError::Validation("inflated payload too large".into()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn peer(name: &str) -> PeerId {
        name.parse().unwrap()
    }

    struct Pair {
        alice: SecurityEnvelope,
        bob: SecurityEnvelope,
        table: Arc<StaticKeys>,
    }

    fn pair_with(alice_id: Identity, bob_id: Identity) -> Pair {
        let table = Arc::new(StaticKeys::new());
        table.insert(alice_id.peer_id().clone(), alice_id.keys());
        table.insert(bob_id.peer_id().clone(), bob_id.keys());
        Pair {
            alice: SecurityEnvelope::new(alice_id, table.clone()),
            bob: SecurityEnvelope::new(bob_id, table.clone()),
            table,
        }
    }

    fn pair() -> Pair {
        pair_with(
            Identity::from_seed(peer("alice"), [1u8; 32]),
            Identity::from_seed(peer("bob"), [2u8; 32]),
        )
    }

    fn to_bob(payload: impl Into<Payload>) -> Envelope {
        Envelope::builder("chat")
            .from(peer("alice"))
            .to(peer("bob"))
            .payload(payload)
            .encrypt()
            .compress()
            .build()
    }

    #[tokio::test]
    async fn roundtrip_text() {
        let p = pair();
        let mut env = to_bob("hello bob");
        p.alice.encrypt(&mut env).await.unwrap();
        assert!(env.payload.is_none());
        assert!(!env.transport_payload.is_empty());
        assert!(!env.need_compress, "small payloads are not compressed");

        let mut wire = Envelope::from_bytes(&env.to_bytes().unwrap()).unwrap();
        p.bob.decrypt(&mut wire).await.unwrap();
        assert_eq!(wire.payload, Some(Payload::from("hello bob")));
        assert!(wire.transport_payload.is_empty());
    }

    #[tokio::test]
    async fn large_payload_is_compressed() {
        let p = pair();
        let mut env = to_bob("x".repeat(10_000));
        env.need_encrypt = false;
        p.alice.encrypt(&mut env).await.unwrap();
        assert!(env.need_compress);
        assert!(env.transport_payload.len() < 10_000);

        p.bob.decrypt(&mut env).await.unwrap();
        assert_eq!(env.payload, Some(Payload::from("x".repeat(10_000))));
    }

    #[tokio::test]
    async fn relayed_envelope_is_untouched() {
        let p = pair();
        let mut env = to_bob("hi");
        p.alice.encrypt(&mut env).await.unwrap();
        let before = env.clone();

        // Bob did not originate it: encrypt is a no-op.
        p.bob.encrypt(&mut env).await.unwrap();
        assert_eq!(env, before);

        // Nothing decoded and nothing on the wire: both are no-ops.
        let mut empty = Envelope::builder("chat").from(peer("bob")).to(peer("alice")).build();
        p.bob.encrypt(&mut empty).await.unwrap();
        p.alice.decrypt(&mut empty).await.unwrap();
        assert!(empty.payload.is_none() && empty.transport_payload.is_empty());
    }

    #[tokio::test]
    async fn tampered_signature_is_security_error() {
        let p = pair();
        let mut env = to_bob("hi");
        p.alice.encrypt(&mut env).await.unwrap();
        env.payload_signature[0] ^= 0x01;
        let err = p.bob.decrypt(&mut env).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Security(_)), "{err}");
    }

    #[tokio::test]
    async fn tampered_ciphertext_is_security_error() {
        let p = pair();
        let mut env = to_bob("hi");
        p.alice.encrypt(&mut env).await.unwrap();
        let mut raw = STANDARD.decode(&env.transport_payload).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        env.transport_payload = STANDARD.encode(raw);
        let err = p.bob.decrypt(&mut env).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Security(_)));
    }

    #[tokio::test]
    async fn wrong_recipient_cannot_open() {
        let p = pair();
        let carol = SecurityEnvelope::new(Identity::from_seed(peer("carol"), [3u8; 32]), p.table.clone());
        let mut env = to_bob("for bob only");
        p.alice.encrypt(&mut env).await.unwrap();
        assert!(matches!(carol.decrypt(&mut env).await, Err(ProtocolError::Security(_))));
    }

    #[tokio::test]
    async fn unknown_recipient_key_is_security_error() {
        let p = pair();
        let mut env = Envelope::builder("chat")
            .from(peer("alice"))
            .to(peer("stranger"))
            .payload("hi")
            .encrypt()
            .build();
        assert!(matches!(p.alice.encrypt(&mut env).await, Err(ProtocolError::Security(_))));
    }

    #[tokio::test]
    async fn topic_messages_cannot_be_encrypted() {
        let p = pair();
        let mut env = Envelope::builder("news")
            .from(peer("alice"))
            .topic("weather")
            .payload("sunny")
            .encrypt()
            .build();
        assert!(matches!(p.alice.encrypt(&mut env).await, Err(ProtocolError::Validation(_))));
    }

    #[tokio::test]
    async fn recipient_rotation_still_opens_old_wraps() {
        let p = pair();
        let mut env = to_bob("sealed before rotation");
        p.alice.encrypt(&mut env).await.unwrap();

        let mut bob_id = p.bob.identity().clone();
        bob_id.rotate();
        let rotated_bob = SecurityEnvelope::new(bob_id, p.table.clone());
        rotated_bob.decrypt(&mut env).await.unwrap();
        assert_eq!(env.payload, Some(Payload::from("sealed before rotation")));
    }

    #[tokio::test]
    async fn sender_rotation_verifies_against_stale_key() {
        let p = pair();
        let mut alice_id = p.alice.identity().clone();
        alice_id.rotate();
        // The table still holds alice's pre-rotation key as current.
        let rotated_alice = SecurityEnvelope::new(alice_id, p.table.clone());

        let mut env = to_bob("signed twice");
        rotated_alice.encrypt(&mut env).await.unwrap();
        assert!(!env.previous_key_payload_signature.is_empty());
        p.bob.decrypt(&mut env).await.unwrap();
    }

    #[tokio::test]
    async fn sender_rotation_verifies_against_known_previous() {
        let p = pair();
        let old_alice = p.alice.identity().clone();
        let mut new_alice = old_alice.clone();
        new_alice.rotate();
        // Bob learned about the rotation, alice still signs with her old key.
        p.table.insert(peer("alice"), new_alice.keys());

        let mut env = to_bob("old key");
        p.alice.encrypt(&mut env).await.unwrap();
        p.bob.decrypt(&mut env).await.unwrap();
        assert_eq!(env.payload, Some(Payload::from("old key")));
    }

    #[test]
    fn inflate_rejects_garbage() {
        assert!(decompress(b"definitely not zlib").is_err());
        assert_eq!(decompress(&compress(b"abc").unwrap()).unwrap(), b"abc");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn any_text_roundtrips(text in ".{0,3000}", compress_it in any::<bool>()) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let p = pair();
                let mut env = to_bob(text.clone());
                env.need_compress = compress_it;
                p.alice.encrypt(&mut env).await.unwrap();
                let mut wire = Envelope::from_bytes(&env.to_bytes().unwrap()).unwrap();
                p.bob.decrypt(&mut wire).await.unwrap();
                assert_eq!(wire.payload, Some(Payload::Text(text)));
            });
        }
    }
}
