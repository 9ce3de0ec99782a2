//! Record validation and replica selection.
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::{DirectoryError, DirectoryKey, Freshness};

/// Per-namespace gatekeeper for directory values.
pub trait Validator: Send + Sync {
    /// Reject malformed or impersonated values.
    fn validate(&self, key: &DirectoryKey, value: &[u8]) -> Result<(), DirectoryError>;

    /// Index of the best candidate. Callers put the incumbent first.
    fn select(&self, key: &DirectoryKey, candidates: &[&[u8]]) -> Result<usize, DirectoryError>;
}

/// Routes each key to the validator registered for its namespace.
#[derive(Clone, Default)]
pub struct NamespacedValidator {
    validators: HashMap<String, Arc<dyn Validator>>,
}

impl NamespacedValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, namespace: impl Into<String>, validator: impl Validator + 'static) -> Self {
        self.validators.insert(namespace.into(), Arc::new(validator));
        self
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.validators.keys().map(String::as_str)
    }

    fn for_key(&self, key: &DirectoryKey) -> Result<&Arc<dyn Validator>, DirectoryError> {
        self.validators.get(key.namespace()).ok_or_else(|| {
            DirectoryError::Validation(format!("unknown namespace {:?}", key.namespace()))
        })
    }
}

impl Validator for NamespacedValidator {
    fn validate(&self, key: &DirectoryKey, value: &[u8]) -> Result<(), DirectoryError> {
        self.for_key(key)?.validate(key, value)
    }

    fn select(&self, key: &DirectoryKey, candidates: &[&[u8]]) -> Result<usize, DirectoryError> {
        self.for_key(key)?.select(key, candidates)
    }
}

/// Validator for JSON records implementing [`Freshness`].
///
/// `select` keeps the freshest candidate; exact ties keep the earliest
/// one, so an incumbent placed first survives a replay of itself.
pub struct FreshnessValidator<R> {
    _record: PhantomData<fn() -> R>,
}

impl<R> FreshnessValidator<R> {
    pub fn new() -> Self {
        Self {
            _record: PhantomData,
        }
    }
}

impl<R> Default for FreshnessValidator<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Freshness> Validator for FreshnessValidator<R> {
    fn validate(&self, key: &DirectoryKey, value: &[u8]) -> Result<(), DirectoryError> {
        let record: R = serde_json::from_slice(value)
            .map_err(|e| DirectoryError::Validation(format!("malformed record under {key}: {e}")))?;
        if !record.matches_key(key) {
            return Err(DirectoryError::Validation(format!(
                "record does not belong under {key}"
            )));
        }
        Ok(())
    }

    fn select(&self, key: &DirectoryKey, candidates: &[&[u8]]) -> Result<usize, DirectoryError> {
        let mut best: Option<(usize, R)> = None;
        for (idx, raw) in candidates.iter().enumerate() {
            let Ok(record) = serde_json::from_slice::<R>(raw) else {
                tracing::debug!("directory: skipping undecodable candidate {idx} for {key}");
                continue;
            };
            match &best {
                Some((_, current)) if !record.is_fresher_than(current) => {}
                _ => best = Some((idx, record)),
            }
        }
        best.map(|(idx, _)| idx).ok_or_else(|| {
            DirectoryError::Validation(format!("no decodable candidate for {key}"))
        })
    }
}

/// Accepts any non-empty value; the incumbent always wins.
///
/// Fits content-addressed namespaces where equal keys mean equal content.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpaqueValidator;

impl Validator for OpaqueValidator {
    fn validate(&self, key: &DirectoryKey, value: &[u8]) -> Result<(), DirectoryError> {
        if value.is_empty() {
            return Err(DirectoryError::Validation(format!("empty value for {key}")));
        }
        Ok(())
    }

    fn select(&self, key: &DirectoryKey, candidates: &[&[u8]]) -> Result<usize, DirectoryError> {
        if candidates.is_empty() {
            return Err(DirectoryError::Validation(format!("no candidate for {key}")));
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Stamp {
        id: String,
        updated: u64,
        accessed: u64,
    }

    impl Freshness for Stamp {
        fn last_updated(&self) -> u64 {
            self.updated
        }
        fn last_accessed(&self) -> u64 {
            self.accessed
        }
        fn matches_key(&self, key: &DirectoryKey) -> bool {
            key.logical() == self.id
        }
        fn dedup_key(&self) -> String {
            self.id.clone()
        }
    }

    fn stamp(updated: u64, accessed: u64) -> Vec<u8> {
        serde_json::to_vec(&Stamp {
            id: "s".into(),
            updated,
            accessed,
        })
        .unwrap()
    }

    fn key() -> DirectoryKey {
        DirectoryKey::new("stamp", "s")
    }

    #[test]
    fn later_update_wins_regardless_of_order() {
        let v = FreshnessValidator::<Stamp>::new();
        let old = stamp(1, 99);
        let new = stamp(2, 0);
        assert_eq!(v.select(&key(), &[&old, &new]).unwrap(), 1);
        assert_eq!(v.select(&key(), &[&new, &old]).unwrap(), 0);
    }

    #[test]
    fn equal_update_falls_back_to_access() {
        let v = FreshnessValidator::<Stamp>::new();
        let a = stamp(5, 1);
        let b = stamp(5, 2);
        assert_eq!(v.select(&key(), &[&a, &b]).unwrap(), 1);
        assert_eq!(v.select(&key(), &[&b, &a]).unwrap(), 0);
    }

    #[test]
    fn exact_tie_keeps_first() {
        let v = FreshnessValidator::<Stamp>::new();
        let a = stamp(5, 5);
        assert_eq!(v.select(&key(), &[&a, &a.clone()]).unwrap(), 0);
    }

    #[test]
    fn undecodable_candidates_lose() {
        let v = FreshnessValidator::<Stamp>::new();
        let good = stamp(1, 1);
        assert_eq!(v.select(&key(), &[b"junk", &good]).unwrap(), 1);
        assert!(v.select(&key(), &[b"junk"]).is_err());
    }

    #[test]
    fn validate_checks_shape_and_key() {
        let v = FreshnessValidator::<Stamp>::new();
        assert!(v.validate(&key(), &stamp(1, 1)).is_ok());
        assert!(v.validate(&DirectoryKey::new("stamp", "other"), &stamp(1, 1)).is_err());
        assert!(v.validate(&key(), b"{").is_err());
    }

    #[test]
    fn namespaced_rejects_unknown_namespace() {
        let v = NamespacedValidator::new()
            .with("stamp", FreshnessValidator::<Stamp>::new())
            .with("block", OpaqueValidator);
        assert!(v.validate(&key(), &stamp(1, 1)).is_ok());
        assert!(v.validate(&DirectoryKey::new("block", "b"), b"data").is_ok());
        assert!(matches!(
            v.validate(&DirectoryKey::new("nope", "s"), b"x"),
            Err(DirectoryError::Validation(_))
        ));
    }
}
