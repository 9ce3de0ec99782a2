use std::time::Duration;

/// Directory-level errors.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("no peers in routing table")]
    NoPeersInRoutingTable,

    #[error("record not found: {key}")]
    NotFound { key: String },

    #[error("cannot replace newer with older")]
    StaleValue,

    #[error("directory query timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("record codec error: {0}")]
    Codec(String),

    #[error("invalid directory key: {0:?}")]
    InvalidKey(String),

    #[error("overlay error: {0}")]
    Overlay(#[source] anyhow::Error),
}

impl DirectoryError {
    /// Conditions that are expected in a churny overlay: nobody to ask,
    /// or somebody already holds something newer.
    pub fn is_steady_state(&self) -> bool {
        matches!(self, Self::NoPeersInRoutingTable | Self::StaleValue)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::NoPeersInRoutingTable)
    }
}

impl From<serde_json::Error> for DirectoryError {
    fn from(e: serde_json::Error) -> Self {
        DirectoryError::Codec(e.to_string())
    }
}
