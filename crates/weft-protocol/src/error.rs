use std::time::Duration;

use weft_dht::DirectoryError;
use weft_transport::TransportError;

/// Protocol-level errors for Weft.
///
/// Wraps transport and directory errors and adds the envelope, security
/// and routing failures. Every variant maps to an [`ErrorKind`] so handlers
/// can answer with a typed error envelope instead of failing silently.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid message: {0}")]
    Validation(String),

    #[error("security check failed: {0}")]
    Security(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("routing error: {0}")]
    Routing(String),

    #[error("remote error {status}: {tip}")]
    Remote { status: u16, tip: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("no response to {uuid} within {after:?}")]
    ResponseTimeout { uuid: String, after: Duration },

    #[error("mailbox storage error: {0}")]
    Storage(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("node is shutting down")]
    Shutdown,
}

/// Coarse error class carried back to the sender in error envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Security,
    NotFound,
    Transport,
    Routing,
    Remote,
    Internal,
}

impl ErrorKind {
    /// HTTP-flavoured status code used in the envelope `status_code` field.
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::Security => 401,
            ErrorKind::NotFound => 404,
            ErrorKind::Routing => 421,
            ErrorKind::Remote | ErrorKind::Internal => 500,
            ErrorKind::Transport => 503,
        }
    }

    /// Short machine tag prefixed to the human tip.
    pub fn tag(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Security => "security",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Transport => "transport",
            ErrorKind::Routing => "routing",
            ErrorKind::Remote => "remote",
            ErrorKind::Internal => "internal",
        }
    }
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::Validation(_)
            | ProtocolError::Deserialization(_)
            | ProtocolError::Config(_) => ErrorKind::Validation,
            ProtocolError::Security(_) => ErrorKind::Security,
            ProtocolError::NotFound(_) => ErrorKind::NotFound,
            ProtocolError::Transport(_) | ProtocolError::ResponseTimeout { .. } => {
                ErrorKind::Transport
            }
            ProtocolError::Directory(e) => match e {
                DirectoryError::Validation(_) | DirectoryError::InvalidKey(_) => {
                    ErrorKind::Validation
                }
                DirectoryError::NotFound { .. } | DirectoryError::NoPeersInRoutingTable => {
                    ErrorKind::NotFound
                }
                DirectoryError::Timeout { .. } | DirectoryError::Overlay(_) => ErrorKind::Transport,
                DirectoryError::StaleValue | DirectoryError::Codec(_) => ErrorKind::Internal,
            },
            ProtocolError::Routing(_) => ErrorKind::Routing,
            ProtocolError::Remote { .. } => ErrorKind::Remote,
            ProtocolError::Serialization(_)
            | ProtocolError::Storage(_)
            | ProtocolError::Shutdown => ErrorKind::Internal,
        }
    }

    /// Status code for an error envelope answering this failure.
    pub fn status_code(&self) -> u16 {
        match self {
            ProtocolError::Remote { status, .. } => *status,
            ProtocolError::ResponseTimeout { .. } => 504,
            other => other.kind().status_code(),
        }
    }

    /// Worth another attempt later: the network or storage may recover.
    /// Validation, security and routing failures never will.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Transport(_)
                | ProtocolError::Directory(_)
                | ProtocolError::NotFound(_)
                | ProtocolError::ResponseTimeout { .. }
                | ProtocolError::Storage(_)
        )
    }

    /// `"{tag}: {message}"` as written into an error envelope's tip.
    pub fn tip(&self) -> String {
        format!("{}: {self}", self.kind().tag())
    }
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(e.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            ProtocolError::Serialization(e.to_string())
        } else {
            ProtocolError::Deserialization(e.to_string())
        }
    }
}

impl From<rusqlite::Error> for ProtocolError {
    fn from(e: rusqlite::Error) -> Self {
        ProtocolError::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_routing() {
        let err = ProtocolError::Routing("message addressed to self".into());
        assert_eq!(err.to_string(), "routing error: message addressed to self");
    }

    #[test]
    fn status_codes_follow_kind() {
        assert_eq!(ProtocolError::Validation("x".into()).status_code(), 400);
        assert_eq!(ProtocolError::Security("x".into()).status_code(), 401);
        assert_eq!(ProtocolError::NotFound("x".into()).status_code(), 404);
        assert_eq!(ProtocolError::Routing("x".into()).status_code(), 421);
        assert_eq!(ProtocolError::Shutdown.status_code(), 500);
        let remote = ProtocolError::Remote {
            status: 418,
            tip: "teapot".into(),
        };
        assert_eq!(remote.status_code(), 418);
        let timeout = ProtocolError::ResponseTimeout {
            uuid: "u".into(),
            after: Duration::from_secs(1),
        };
        assert_eq!(timeout.status_code(), 504);
    }

    #[test]
    fn directory_errors_are_classified() {
        let err: ProtocolError = DirectoryError::NoPeersInRoutingTable.into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err: ProtocolError = DirectoryError::Validation("bad".into()).into();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn tip_carries_tag() {
        let err = ProtocolError::Security("bad signature".into());
        assert_eq!(err.tip(), "security: security check failed: bad signature");
    }

    #[test]
    fn only_recoverable_errors_retry() {
        assert!(ProtocolError::NotFound("x".into()).is_retryable());
        assert!(ProtocolError::Storage("x".into()).is_retryable());
        assert!(!ProtocolError::Security("x".into()).is_retryable());
        assert!(!ProtocolError::Routing("x".into()).is_retryable());
        assert!(!ProtocolError::Shutdown.is_retryable());
    }

    #[test]
    fn rmp_errors_convert() {
        let err: ProtocolError = rmp_serde::from_slice::<String>(&[0xc1]).unwrap_err().into();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }
}
