use std::time::Duration;

/// Configuration for the transport layer and its [`ConnectionPool`](crate::ConnectionPool).
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use std::time::Duration;
/// use weft_transport::TransportConfig;
///
/// let config = TransportConfig::new()
///     .max_message_size(2 * 1024 * 1024)
///     .write_timeout(Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Protocol identifier used when opening logical streams.
    pub(crate) protocol: String,
    /// Maximum frame size in bytes, both directions.
    pub(crate) max_message_size: usize,
    /// Deadline for receiving a frame body once its header has arrived.
    pub(crate) read_timeout: Duration,
    /// Deadline for writing one frame.
    pub(crate) write_timeout: Duration,
    /// Deadline for dialing a peer and for opening one stream on a link.
    pub(crate) connect_timeout: Duration,
    /// Channel buffer size for inbound frames.
    pub(crate) recv_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConfig {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self {
            protocol: crate::WEFT_PROTOCOL.to_string(),
            max_message_size: 1024 * 1024, // 1 MB
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            recv_buffer: 256,
        }
    }

    /// Set the protocol identifier.
    pub fn protocol_id(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    /// Set maximum frame size (default: 1 MB).
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Set the frame body read deadline (default: 30 s).
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the frame write deadline (default: 10 s).
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the dial and stream-open deadline (default: 10 s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the inbound frame channel capacity (default: 256).
    pub fn recv_buffer(mut self, capacity: usize) -> Self {
        self.recv_buffer = capacity;
        self
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn frame_limit(&self) -> usize {
        self.max_message_size
    }

    pub fn inbound_capacity(&self) -> usize {
        self.recv_buffer
    }

    /// Reject configurations the pool cannot run with.
    pub fn validate(&self) -> Result<(), crate::TransportError> {
        if self.protocol.is_empty() {
            return Err(crate::TransportError::Config("protocol id is empty".into()));
        }
        if self.max_message_size == 0 {
            return Err(crate::TransportError::Config("max_message_size is 0".into()));
        }
        if self.recv_buffer == 0 {
            return Err(crate::TransportError::Config("recv_buffer is 0".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(crate::TransportError::Config("connect_timeout is 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = TransportConfig::new();
        assert_eq!(config.protocol(), crate::WEFT_PROTOCOL);
        assert_eq!(config.frame_limit(), 1024 * 1024);
        assert_eq!(config.inbound_capacity(), 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_overrides() {
        let config = TransportConfig::new()
            .protocol_id("/test/1")
            .max_message_size(64)
            .read_timeout(Duration::from_millis(5))
            .write_timeout(Duration::from_millis(7))
            .connect_timeout(Duration::from_millis(9))
            .recv_buffer(3);
        assert_eq!(config.protocol(), "/test/1");
        assert_eq!(config.frame_limit(), 64);
        assert_eq!(config.read_timeout, Duration::from_millis(5));
        assert_eq!(config.write_timeout, Duration::from_millis(7));
        assert_eq!(config.connect_timeout, Duration::from_millis(9));
        assert_eq!(config.inbound_capacity(), 3);
    }

    #[test]
    fn validate_rejects_zero_sizes() {
        assert!(TransportConfig::new().max_message_size(0).validate().is_err());
        assert!(TransportConfig::new().recv_buffer(0).validate().is_err());
        assert!(TransportConfig::new().protocol_id("").validate().is_err());
        assert!(TransportConfig::new()
            .connect_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }
}
