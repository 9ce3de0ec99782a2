use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{DirectoryError, DirectoryKey};

/// A stored value plus the time this node received it.
///
/// Everything written locally or to the overlay is wrapped; validators only
/// ever see the inner `value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordWrapper {
    #[serde(with = "b64")]
    pub value: Vec<u8>,
    pub received_at: u64,
}

impl RecordWrapper {
    pub fn new(value: Vec<u8>) -> Self {
        Self {
            value,
            received_at: crate::now_ms(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // Plain struct of bytes and an integer.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DirectoryError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A directory record ordered by logical timestamps.
///
/// Between two replicas, the later `last_updated` wins; equal
/// `last_updated` falls back to the later `last_accessed`.
pub trait Freshness: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// When the record content last changed (ms).
    fn last_updated(&self) -> u64;

    /// When the subject was last seen alive (ms).
    fn last_accessed(&self) -> u64;

    /// Whether this record may be stored under `key`.
    fn matches_key(&self, key: &DirectoryKey) -> bool;

    /// Identity used to collapse replicas of the same record.
    fn dedup_key(&self) -> String;

    /// Strictly fresher than `other`.
    fn is_fresher_than(&self, other: &Self) -> bool {
        (self.last_updated(), self.last_accessed()) > (other.last_updated(), other.last_accessed())
    }
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapper_json_shape() {
        let wrapper = RecordWrapper {
            value: b"{}".to_vec(),
            received_at: 7,
        };
        let json: serde_json::Value = serde_json::from_slice(&wrapper.encode()).unwrap();
        assert_eq!(json["value"], "e30=");
        assert_eq!(json["received_at"], 7);
        assert_eq!(RecordWrapper::decode(&wrapper.encode()).unwrap(), wrapper);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(RecordWrapper::decode(b"not json").is_err());
        assert!(RecordWrapper::decode(br#"{"value":"***","received_at":1}"#).is_err());
    }
}
