use std::time::Duration;

use crate::PeerId;

/// Errors returned by the Weft transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection to {peer} failed: {source}")]
    Connect {
        peer: PeerId,
        #[source]
        source: anyhow::Error,
    },

    #[error("send to {peer} failed: {source}")]
    Send {
        peer: PeerId,
        #[source]
        source: anyhow::Error,
    },

    #[error("receive failed: {0}")]
    Receive(#[source] anyhow::Error),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("stream to {peer} is closed")]
    Closed { peer: PeerId },

    #[error("invalid peer id: {0:?}")]
    InvalidPeerId(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TransportError {
    /// Whether this error was a read/write deadline expiring.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_timeout() {
        let err = TransportError::Timeout {
            operation: "write",
            after: Duration::from_secs(2),
        };
        assert_eq!(err.to_string(), "write timed out after 2s");
        assert!(err.is_timeout());
    }

    #[test]
    fn display_message_too_large() {
        let err = TransportError::MessageTooLarge { size: 10, max: 4 };
        assert_eq!(err.to_string(), "message too large: 10 bytes (max 4)");
        assert!(!err.is_timeout());
    }

    #[test]
    fn display_invalid_peer_id() {
        let err = TransportError::InvalidPeerId(String::new());
        assert_eq!(err.to_string(), "invalid peer id: \"\"");
    }
}
