//! Directory keys: `/{namespace}/{base64url(logical)}`.
use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::DirectoryError;

/// A namespaced directory key.
///
/// The logical part is either a bare identifier (peer id, block id) or a
/// small JSON map for composite lookups. Namespaces select the validator
/// and the owning service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirectoryKey {
    namespace: String,
    logical: String,
}

impl DirectoryKey {
    /// Key for a bare identifier.
    pub fn new(namespace: impl Into<String>, logical: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            logical: logical.into(),
        }
    }

    /// Key for a composite lookup. Field order does not matter.
    pub fn composite(namespace: impl Into<String>, fields: &BTreeMap<String, String>) -> Self {
        // A string map always serializes.
        let logical = serde_json::to_string(fields).unwrap_or_default();
        Self::new(namespace, logical)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn logical(&self) -> &str {
        &self.logical
    }

    /// Fields of a composite key, `None` for bare keys.
    pub fn composite_fields(&self) -> Option<BTreeMap<String, String>> {
        if !self.logical.starts_with('{') {
            return None;
        }
        serde_json::from_str(&self.logical).ok()
    }

    /// Parse the rendered form `/{namespace}/{base64url}`.
    pub fn parse(rendered: &str) -> Result<Self, DirectoryError> {
        let invalid = || DirectoryError::InvalidKey(rendered.to_string());

        let rest = rendered.strip_prefix('/').ok_or_else(invalid)?;
        let (namespace, encoded) = rest.split_once('/').ok_or_else(invalid)?;
        if namespace.is_empty() || encoded.is_empty() || encoded.contains('/') {
            return Err(invalid());
        }
        let bytes = URL_SAFE_NO_PAD.decode(encoded).map_err(|_| invalid())?;
        let logical = String::from_utf8(bytes).map_err(|_| invalid())?;

        Ok(Self::new(namespace, logical))
    }

    /// Position in the 256-bit DHT key space.
    pub fn hash(&self) -> [u8; 32] {
        Sha256::digest(self.to_string().as_bytes()).into()
    }
}

impl fmt::Display for DirectoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/{}/{}",
            self.namespace,
            URL_SAFE_NO_PAD.encode(self.logical.as_bytes())
        )
    }
}
