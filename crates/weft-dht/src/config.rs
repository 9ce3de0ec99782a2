use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use crate::namespace;

/// Read strategy for directory lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FaultTolerance {
    /// Level 0: always ask the network, never touch the local mirror.
    #[default]
    NetworkOnly,
    /// Level 1: level 0, then prime the local mirror with the result.
    WriteThrough,
    /// Level 2: local-first with reconciliation against the network.
    LocalFirst,
}

impl FaultTolerance {
    pub fn level(self) -> u8 {
        match self {
            Self::NetworkOnly => 0,
            Self::WriteThrough => 1,
            Self::LocalFirst => 2,
        }
    }

    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::NetworkOnly),
            1 => Some(Self::WriteThrough),
            2 => Some(Self::LocalFirst),
            _ => None,
        }
    }
}

/// Configuration for the [`DirectoryStore`](crate::DirectoryStore).
///
/// ```rust
/// use std::time::Duration;
/// use weft_dht::{DirectoryConfig, FaultTolerance};
///
/// let config = DirectoryConfig::new()
///     .query_timeout(Duration::from_millis(500))
///     .fault_tolerance("block", FaultTolerance::WriteThrough);
/// assert!(config.is_best_effort("block"));
/// ```
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub(crate) best_effort: BTreeSet<String>,
    pub(crate) query_timeout: Duration,
    pub(crate) levels: HashMap<String, FaultTolerance>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectoryConfig {
    pub fn new() -> Self {
        let best_effort = [namespace::PEER_CLIENT, namespace::BLOCK, namespace::TRANSACTION]
            .into_iter()
            .map(String::from)
            .collect();
        let mut levels = HashMap::new();
        levels.insert(namespace::PEER_CLIENT.to_string(), FaultTolerance::LocalFirst);

        Self {
            best_effort,
            query_timeout: Duration::from_secs(1),
            levels,
        }
    }

    /// Mark a namespace best-effort: steady-state overlay errors on put
    /// are swallowed and reported as success.
    pub fn best_effort(mut self, namespace: impl Into<String>) -> Self {
        self.best_effort.insert(namespace.into());
        self
    }

    /// Make a namespace strict again.
    pub fn strict(mut self, namespace: &str) -> Self {
        self.best_effort.remove(namespace);
        self
    }

    /// Deadline for one network query (default: 1 s).
    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Read strategy for a namespace (default: level 0, level 2 for `peer-client`).
    pub fn fault_tolerance(mut self, namespace: impl Into<String>, level: FaultTolerance) -> Self {
        self.levels.insert(namespace.into(), level);
        self
    }

    pub fn is_best_effort(&self, namespace: &str) -> bool {
        self.best_effort.contains(namespace)
    }

    pub fn level_for(&self, namespace: &str) -> FaultTolerance {
        self.levels.get(namespace).copied().unwrap_or_default()
    }

    pub fn timeout(&self) -> Duration {
        self.query_timeout
    }
}
