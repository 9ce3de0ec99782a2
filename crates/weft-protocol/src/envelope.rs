use serde::{Deserialize, Serialize};
use weft_transport::{PeerId, SessionId};

use crate::payload::Payload;
use crate::ProtocolError;

/// Default hop budget for a relayed envelope.
pub const DEFAULT_TTL: u32 = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    #[default]
    Request,
    Response,
}

/// The unit routed by the fabric.
///
/// Serialized as MessagePack. Addressing comes in three tiers:
/// - *target*: the final recipient, plus where routing found it attached,
/// - *src*: the originator, plus the first overlay node that received it,
/// - *connect*: the next hop for this transmission attempt.
///
/// `payload` is the decoded form and never crosses the wire; the wire form
/// is `transport_payload`. At rest at most one of them is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub uuid: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_peer_id: Option<PeerId>,
    #[serde(default)]
    pub target_client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_connect_peer_id: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_connect_session_id: Option<SessionId>,
    #[serde(default)]
    pub target_connect_address: String,

    #[serde(default)]
    pub topic: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_peer_id: Option<PeerId>,
    #[serde(default)]
    pub src_client_id: String,
    #[serde(default)]
    pub src_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_connect_peer_id: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_connect_session_id: Option<SessionId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_peer_id: Option<PeerId>,
    #[serde(default)]
    pub connect_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_session_id: Option<SessionId>,

    pub message_type: String,
    #[serde(default)]
    pub direction: MessageDirection,
    #[serde(default)]
    pub payload_type: String,
    /// Wrapped symmetric key (MessagePack `WrappedKey`), empty if unencrypted.
    #[serde(default)]
    pub payload_key: Vec<u8>,
    #[serde(default)]
    pub need_compress: bool,
    #[serde(default)]
    pub need_encrypt: bool,
    /// Base64 of the (encrypted, compressed) payload bytes.
    #[serde(default)]
    pub transport_payload: String,
    #[serde(default)]
    pub payload_signature: Vec<u8>,
    #[serde(default)]
    pub previous_key_payload_signature: Vec<u8>,

    #[serde(default)]
    pub tip: String,
    #[serde(default)]
    pub status_code: u16,
    /// Remaining hop count. Decremented at each forward.
    #[serde(default = "default_ttl")]
    pub ttl: u32,

    #[serde(skip)]
    pub payload: Option<Payload>,
}

fn default_ttl() -> u32 {
    DEFAULT_TTL
}

impl Envelope {
    /// New request of `message_type` with a fresh uuid.
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            message_type: message_type.into(),
            ttl: DEFAULT_TTL,
            ..Default::default()
        }
    }

    pub fn builder(message_type: impl Into<String>) -> EnvelopeBuilder {
        EnvelopeBuilder {
            envelope: Envelope::new(message_type),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec_named(self).map_err(Into::into)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }

    pub fn is_request(&self) -> bool {
        self.direction == MessageDirection::Request
    }

    pub fn is_response(&self) -> bool {
        self.direction == MessageDirection::Response
    }

    pub fn has_topic(&self) -> bool {
        !self.topic.is_empty()
    }

    /// No unicast target set.
    pub fn has_no_target(&self) -> bool {
        self.target_peer_id.is_none()
    }

    /// Error-carrying envelope (non-zero status).
    pub fn is_error(&self) -> bool {
        self.status_code != 0
    }

    /// Decrement TTL. Returns `Err` if TTL is already 0.
    pub fn decrement_ttl(&mut self) -> Result<(), ProtocolError> {
        if self.ttl == 0 {
            return Err(ProtocolError::Routing("TTL exhausted".into()));
        }
        self.ttl -= 1;
        Ok(())
    }

    /// Key for duplicate suppression: a request and its response share a uuid.
    pub fn dedup_key(&self) -> (String, MessageDirection) {
        (self.uuid.clone(), self.direction)
    }

    /// Response to this request from `self_id`, same uuid, addressed back
    /// to the originator.
    pub fn reply(&self, self_id: &PeerId, payload: Option<Payload>) -> Envelope {
        Envelope {
            uuid: self.uuid.clone(),
            target_peer_id: self.src_peer_id.clone(),
            target_client_id: self.src_client_id.clone(),
            target_connect_peer_id: self.src_connect_peer_id.clone(),
            target_connect_session_id: self.src_connect_session_id.clone(),
            src_peer_id: Some(self_id.clone()),
            message_type: self.message_type.clone(),
            direction: MessageDirection::Response,
            payload_type: payload
                .as_ref()
                .map(|p| p.type_tag().to_string())
                .unwrap_or_default(),
            need_compress: self.need_compress,
            need_encrypt: self.need_encrypt && payload.is_some(),
            ttl: DEFAULT_TTL,
            payload,
            ..Default::default()
        }
    }

    /// Error response to this request.
    pub fn error_reply(&self, self_id: &PeerId, err: &ProtocolError) -> Envelope {
        let mut reply = self.reply(self_id, None);
        reply.need_encrypt = false;
        reply.need_compress = false;
        reply.status_code = err.status_code();
        reply.tip = err.tip();
        reply
    }
}

/// Fluent builder for outgoing envelopes.
///
/// ```ignore
/// let env = Envelope::builder("chat")
///     .to(bob)
///     .from(alice)
///     .payload("hello")
///     .encrypt()
///     .build();
/// ```
pub struct EnvelopeBuilder {
    envelope: Envelope,
}

impl EnvelopeBuilder {
    pub fn to(mut self, peer: PeerId) -> Self {
        self.envelope.target_peer_id = Some(peer);
        self
    }

    pub fn to_client(mut self, peer: PeerId, client_id: impl Into<String>) -> Self {
        self.envelope.target_peer_id = Some(peer);
        self.envelope.target_client_id = client_id.into();
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.envelope.topic = topic.into();
        self
    }

    pub fn from(mut self, peer: PeerId) -> Self {
        self.envelope.src_peer_id = Some(peer);
        self
    }

    pub fn from_client(mut self, client_id: impl Into<String>) -> Self {
        self.envelope.src_client_id = client_id.into();
        self
    }

    pub fn payload(mut self, payload: impl Into<Payload>) -> Self {
        let payload = payload.into();
        self.envelope.payload_type = payload.type_tag().to_string();
        self.envelope.payload = Some(payload);
        self
    }

    pub fn encrypt(mut self) -> Self {
        self.envelope.need_encrypt = true;
        self
    }

    pub fn compress(mut self) -> Self {
        self.envelope.need_compress = true;
        self
    }

    pub fn ttl(mut self, ttl: u32) -> Self {
        self.envelope.ttl = ttl;
        self
    }

    pub fn build(self) -> Envelope {
        self.envelope
    }
}
