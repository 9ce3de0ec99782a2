/// Cryptographic primitives behind the security envelope.
///
/// Payloads are sealed with a fresh random 256-bit key under
/// XChaCha20-Poly1305. That key is wrapped for the recipient with an
/// ephemeral X25519 Diffie-Hellman exchange, HKDF-SHA256 and a second
/// XChaCha20-Poly1305 pass.
///
/// Key derivation: the recipient's Ed25519 key is converted to X25519 via
/// the standard Edwards→Montgomery map (same as libsodium).
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519Secret};

use crate::ProtocolError;

/// HKDF info string for domain separation.
const HKDF_INFO: &[u8] = b"weft-payload-key-wrap-xchacha20poly1305-v1";

const NONCE_LEN: usize = 24;

/// A symmetric payload key sealed for one recipient.
///
/// Serialized as MessagePack into the envelope's `payload_key` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WrappedKey {
    /// XChaCha20-Poly1305 ciphertext of the 32-byte key (with auth tag).
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; 24],
    /// Sender's ephemeral X25519 public key.
    pub ephemeral_pk: [u8; 32],
}

impl WrappedKey {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(data)
            .map_err(|e| ProtocolError::Security(format!("unreadable payload key: {e}")))
    }
}

fn random_bytes<const N: usize>() -> [u8; N] {
    use chacha20poly1305::aead::rand_core::{OsRng, RngCore};
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// Convert an Ed25519 public key to an X25519 public key.
///
/// Equivalent to libsodium's `crypto_sign_ed25519_pk_to_curve25519`.
pub fn ed25519_to_x25519_public(ed25519_pk: &[u8; 32]) -> Result<[u8; 32], ProtocolError> {
    let edwards = CompressedEdwardsY(*ed25519_pk)
        .decompress()
        .ok_or_else(|| ProtocolError::Security("invalid Ed25519 public key".into()))?;
    Ok(edwards.to_montgomery().to_bytes())
}

/// Convert an Ed25519 secret seed to an X25519 secret key.
///
/// SHA-512(seed), first 32 bytes, clamped.
pub fn ed25519_to_x25519_secret(ed25519_seed: &[u8; 32]) -> [u8; 32] {
    let hash = Sha512::digest(ed25519_seed);
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&hash[..32]);
    secret[0] &= 248;
    secret[31] &= 127;
    secret[31] |= 64;
    secret
}

fn derive_key(shared_secret: &[u8; 32]) -> Result<[u8; 32], ProtocolError> {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = [0u8; 32];
    hkdf.expand(HKDF_INFO, &mut key)
        .map_err(|e| ProtocolError::Security(format!("key derivation failed: {e}")))?;
    Ok(key)
}

/// A fresh random 256-bit payload key.
pub fn fresh_key() -> [u8; 32] {
    random_bytes()
}

/// Seal `plaintext` under `key`. Output is `nonce || ciphertext`.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let cipher = XChaCha20Poly1305::new(&(*key).into());
    let nonce_bytes: [u8; NONCE_LEN] = random_bytes();
    let ciphertext = cipher
        .encrypt(&XNonce::from(nonce_bytes), plaintext)
        .map_err(|e| ProtocolError::Security(format!("encryption failed: {e}")))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Inverse of [`seal`].
pub fn open(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if sealed.len() < NONCE_LEN {
        return Err(ProtocolError::Security("sealed payload too short".into()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new(&(*key).into());
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| ProtocolError::Security("decryption failed: authentication error".into()))
}

/// Wrap a payload key for the holder of `recipient_ed25519_pk`.
pub fn wrap_key(key: &[u8; 32], recipient_ed25519_pk: &[u8; 32]) -> Result<WrappedKey, ProtocolError> {
    use chacha20poly1305::aead::rand_core::OsRng;

    let recipient = X25519PublicKey::from(ed25519_to_x25519_public(recipient_ed25519_pk)?);
    let ephemeral_secret = X25519Secret::random_from_rng(OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);

    let shared = ephemeral_secret.diffie_hellman(&recipient);
    let kek = derive_key(shared.as_bytes())?;
    let cipher = XChaCha20Poly1305::new(&kek.into());

    let nonce: [u8; NONCE_LEN] = random_bytes();
    let ciphertext = cipher
        .encrypt(&XNonce::from(nonce), key.as_slice())
        .map_err(|e| ProtocolError::Security(format!("key wrap failed: {e}")))?;

    Ok(WrappedKey {
        ciphertext,
        nonce,
        ephemeral_pk: ephemeral_public.to_bytes(),
    })
}

/// Recover a payload key with the recipient's Ed25519 secret seed.
pub fn unwrap_key(wrapped: &WrappedKey, recipient_ed25519_seed: &[u8; 32]) -> Result<[u8; 32], ProtocolError> {
    let secret = X25519Secret::from(ed25519_to_x25519_secret(recipient_ed25519_seed));
    let shared = secret.diffie_hellman(&X25519PublicKey::from(wrapped.ephemeral_pk));
    let kek = derive_key(shared.as_bytes())?;
    let cipher = XChaCha20Poly1305::new(&kek.into());

    let plain = cipher
        .decrypt(&XNonce::from(wrapped.nonce), wrapped.ciphertext.as_ref())
        .map_err(|_| ProtocolError::Security("payload key unwrap failed".into()))?;
    plain
        .try_into()
        .map_err(|_| ProtocolError::Security("payload key has wrong length".into()))
}

/// Detached Ed25519 signature.
pub fn sign(key: &SigningKey, message: &[u8]) -> Vec<u8> {
    key.sign(message).to_bytes().to_vec()
}

/// Strict Ed25519 verification. Any malformed input is simply `false`.
pub fn verify(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    verifying_key.verify_strict(message, &signature).is_ok()
}

/// Public keys travel in directory records as URL-safe base64.
pub fn encode_key(key: &[u8; 32]) -> String {
    URL_SAFE_NO_PAD.encode(key)
}

pub fn decode_key(encoded: &str) -> Result<[u8; 32], ProtocolError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| ProtocolError::Security(format!("malformed public key: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| ProtocolError::Security("public key must be 32 bytes".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair(seed_byte: u8) -> ([u8; 32], [u8; 32]) {
        let seed = [seed_byte; 32];
        let pk = SigningKey::from_bytes(&seed).verifying_key().to_bytes();
        (seed, pk)
    }

    #[test]
    fn seal_open_roundtrip() {
        let key = fresh_key();
        let sealed = seal(&key, b"hello weft").unwrap();
        assert_eq!(open(&key, &sealed).unwrap(), b"hello weft");
    }

    #[test]
    fn seal_uses_fresh_nonce() {
        let key = fresh_key();
        assert_ne!(seal(&key, b"same").unwrap(), seal(&key, b"same").unwrap());
    }

    #[test]
    fn open_with_wrong_key_fails() {
        let sealed = seal(&fresh_key(), b"secret").unwrap();
        let err = open(&fresh_key(), &sealed).unwrap_err();
        assert!(matches!(err, ProtocolError::Security(_)));
        assert!(open(&fresh_key(), b"short").is_err());
    }

    #[test]
    fn wrap_unwrap_roundtrip() {
        let (seed, pk) = keypair(42);
        let key = fresh_key();
        let wrapped = wrap_key(&key, &pk).unwrap();
        let bytes = wrapped.to_bytes().unwrap();
        let back = WrappedKey::from_bytes(&bytes).unwrap();
        assert_eq!(unwrap_key(&back, &seed).unwrap(), key);
    }

    #[test]
    fn unwrap_with_other_seed_fails() {
        let (_, pk) = keypair(1);
        let (other_seed, _) = keypair(2);
        let wrapped = wrap_key(&fresh_key(), &pk).unwrap();
        assert!(unwrap_key(&wrapped, &other_seed).is_err());
    }

    #[test]
    fn tampered_wrapped_key_fails() {
        let (seed, pk) = keypair(3);
        let mut wrapped = wrap_key(&fresh_key(), &pk).unwrap();
        wrapped.ciphertext[0] ^= 0xFF;
        assert!(unwrap_key(&wrapped, &seed).is_err());
    }

    #[test]
    fn sign_verify() {
        let key = SigningKey::from_bytes(&[9u8; 32]);
        let pk = key.verifying_key().to_bytes();
        let sig = sign(&key, b"payload");
        assert!(verify(&pk, b"payload", &sig));
        assert!(!verify(&pk, b"tampered", &sig));
        assert!(!verify(&pk, b"payload", &sig[..10]));
    }

    #[test]
    fn x25519_conversion_agrees() {
        let (seed, pk) = keypair(5);
        let from_pk = ed25519_to_x25519_public(&pk).unwrap();
        let secret = X25519Secret::from(ed25519_to_x25519_secret(&seed));
        assert_eq!(X25519PublicKey::from(&secret).to_bytes(), from_pk);
    }

    #[test]
    fn key_text_roundtrip() {
        let (_, pk) = keypair(8);
        assert_eq!(decode_key(&encode_key(&pk)).unwrap(), pk);
        assert!(decode_key("not base64!").is_err());
        assert!(decode_key("AAAA").is_err());
    }
}
