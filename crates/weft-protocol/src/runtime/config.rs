use std::time::Duration;

use weft_dht::DirectoryConfig;
use weft_transport::TransportConfig;

use crate::mailbox::DEFAULT_MAILBOX_CAPACITY;
use crate::queue::QueueConfig;
use crate::security::DEFAULT_COMPRESS_THRESHOLD;
use crate::ProtocolError;

pub const ENV_RESPONSE_TIMEOUT_MS: &str = "WEFT_RESPONSE_TIMEOUT_MS";
pub const ENV_MAILBOX_RETENTION_SECS: &str = "WEFT_MAILBOX_RETENTION_SECS";
pub const ENV_QUERY_TIMEOUT_MS: &str = "WEFT_QUERY_TIMEOUT_MS";

/// Configuration for a [`FabricNode`](super::FabricNode).
///
/// `new()` starts from the defaults and applies the `WEFT_*` environment
/// overrides; `Default` ignores the environment.
///
/// ```rust
/// use std::time::Duration;
/// use weft_protocol::FabricConfig;
///
/// let config = FabricConfig::default()
///     .response_timeout(Duration::from_secs(3))
///     .concurrency(4);
/// ```
#[derive(Debug, Clone)]
pub struct FabricConfig {
    pub(crate) transport: TransportConfig,
    pub(crate) directory: DirectoryConfig,
    /// How long `send` waits for the response to a forwarded request.
    pub(crate) response_timeout: Duration,
    /// Age after which undelivered envelopes are discarded.
    pub(crate) mailbox_retention: Duration,
    pub(crate) mailbox_sweep_interval: Duration,
    pub(crate) mailbox_capacity: usize,
    pub(crate) compress_threshold: usize,
    /// Frames dispatched concurrently.
    pub(crate) concurrency: usize,
    pub(crate) max_attempts: u32,
    pub(crate) retry_backoff: Duration,
    pub(crate) queue_capacity: usize,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::new(),
            directory: DirectoryConfig::new(),
            response_timeout: Duration::from_secs(10),
            mailbox_retention: Duration::from_secs(24 * 60 * 60),
            mailbox_sweep_interval: Duration::from_secs(60),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
            concurrency: 16,
            max_attempts: 4,
            retry_backoff: Duration::from_millis(200),
            queue_capacity: 1024,
        }
    }
}

impl FabricConfig {
    /// Defaults plus environment overrides.
    pub fn new() -> Self {
        Self::default().with_env(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`. Unparsable values are ignored.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(ms) = parse_u64(&lookup, ENV_RESPONSE_TIMEOUT_MS) {
            self.response_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_u64(&lookup, ENV_MAILBOX_RETENTION_SECS) {
            self.mailbox_retention = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_u64(&lookup, ENV_QUERY_TIMEOUT_MS) {
            self.directory = self.directory.query_timeout(Duration::from_millis(ms));
        }
        self
    }

    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn directory(mut self, directory: DirectoryConfig) -> Self {
        self.directory = directory;
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn mailbox_retention(mut self, retention: Duration) -> Self {
        self.mailbox_retention = retention;
        self
    }

    pub fn mailbox_sweep_interval(mut self, interval: Duration) -> Self {
        self.mailbox_sweep_interval = interval;
        self
    }

    pub fn mailbox_capacity(mut self, entries: usize) -> Self {
        self.mailbox_capacity = entries;
        self
    }

    pub fn compress_threshold(mut self, bytes: usize) -> Self {
        self.compress_threshold = bytes;
        self
    }

    pub fn concurrency(mut self, jobs: usize) -> Self {
        self.concurrency = jobs;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn queue_capacity(mut self, jobs: usize) -> Self {
        self.queue_capacity = jobs;
        self
    }

    pub fn get_response_timeout(&self) -> Duration {
        self.response_timeout
    }

    pub fn get_mailbox_retention(&self) -> Duration {
        self.mailbox_retention
    }

    pub(crate) fn queue(&self) -> QueueConfig {
        QueueConfig {
            capacity: self.queue_capacity,
            concurrency: self.concurrency,
            max_attempts: self.max_attempts,
            retry_backoff: self.retry_backoff,
        }
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        self.transport
            .validate()
            .map_err(|e| ProtocolError::Config(e.to_string()))?;
        if self.concurrency == 0 {
            return Err(ProtocolError::Config("concurrency is 0".into()));
        }
        if self.mailbox_sweep_interval.is_zero() {
            return Err(ProtocolError::Config("mailbox_sweep_interval is 0".into()));
        }
        if self.response_timeout.is_zero() {
            return Err(ProtocolError::Config("response_timeout is 0".into()));
        }
        Ok(())
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    let raw = lookup(name)?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("config: ignoring {name}={raw:?}: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let config = FabricConfig::default();
        assert_eq!(config.response_timeout, Duration::from_secs(10));
        assert_eq!(config.mailbox_retention, Duration::from_secs(86_400));
        assert_eq!(config.compress_threshold, 2048);
        assert_eq!(config.concurrency, 16);
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.retry_backoff, Duration::from_millis(200));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            (ENV_RESPONSE_TIMEOUT_MS, "1500"),
            (ENV_MAILBOX_RETENTION_SECS, "60"),
            (ENV_QUERY_TIMEOUT_MS, "250"),
        ]
        .into_iter()
        .collect();
        let config = FabricConfig::default().with_env(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.response_timeout, Duration::from_millis(1500));
        assert_eq!(config.mailbox_retention, Duration::from_secs(60));
        assert_eq!(config.directory.timeout(), Duration::from_millis(250));
    }

    #[test]
    fn bad_env_values_are_ignored() {
        let config = FabricConfig::default().with_env(|k| {
            (k == ENV_RESPONSE_TIMEOUT_MS).then(|| "soon".to_string())
        });
        assert_eq!(config.response_timeout, Duration::from_secs(10));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = FabricConfig::default().concurrency(0);
        assert!(matches!(config.validate(), Err(ProtocolError::Config(_))));
    }
}
