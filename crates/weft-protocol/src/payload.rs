//! Decoded message payloads.
//!
//! On the wire a payload is JSON selected by the envelope's `payload_type`
//! tag. Inside the node it is a closed enum, decoded once at the boundary.
use serde_json::{Map, Value};

use crate::directory::PeerClient;
use crate::ProtocolError;

pub const TEXT: &str = "string";
pub const RECORD: &str = "record";
pub const RECORDS: &str = "records";
pub const MAP: &str = "map";

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Record(PeerClient),
    Records(Vec<PeerClient>),
    /// Anything else, kept as a generic JSON object.
    Map(Map<String, Value>),
}

impl Payload {
    /// The `payload_type` tag this variant travels under.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Payload::Text(_) => TEXT,
            Payload::Record(_) => RECORD,
            Payload::Records(_) => RECORDS,
            Payload::Map(_) => MAP,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let bytes = match self {
            Payload::Text(text) => serde_json::to_vec(text),
            Payload::Record(record) => serde_json::to_vec(record),
            Payload::Records(records) => serde_json::to_vec(records),
            Payload::Map(map) => serde_json::to_vec(map),
        };
        bytes.map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Decode `bytes` according to `type_tag`. Unknown tags fall back to a
    /// generic map.
    pub fn from_bytes(type_tag: &str, bytes: &[u8]) -> Result<Self, ProtocolError> {
        let invalid = |e: serde_json::Error| {
            ProtocolError::Validation(format!("payload does not decode as {type_tag:?}: {e}"))
        };
        match type_tag {
            TEXT => serde_json::from_slice(bytes).map(Payload::Text).map_err(invalid),
            RECORD => serde_json::from_slice(bytes).map(Payload::Record).map_err(invalid),
            RECORDS => serde_json::from_slice(bytes).map(Payload::Records).map_err(invalid),
            _ => match serde_json::from_slice::<Value>(bytes).map_err(invalid)? {
                Value::Object(map) => Ok(Payload::Map(map)),
                other => Err(ProtocolError::Validation(format!(
                    "payload of type {type_tag:?} is not an object: {other}"
                ))),
            },
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<PeerClient> for Payload {
    fn from(record: PeerClient) -> Self {
        Payload::Record(record)
    }
}

impl From<Vec<PeerClient>> for Payload {
    fn from(records: Vec<PeerClient>) -> Self {
        Payload::Records(records)
    }
}
