//! Relay configuration
//!
//! All fields have defaults, so a config file only needs the keys it
//! changes. Loaded from JSON by the binary; built in code by tests.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::RelayError;

/// Default read chunk size in bytes
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8192;

/// Default message queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default number of back-to-back read errors before a connection is dropped
pub const DEFAULT_MAX_CONSECUTIVE_READ_ERRORS: u32 = 16;

/// Default limit on one write (or close) to a peer
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default limit on finishing queued deliveries after shutdown
pub const DEFAULT_SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Relay configuration options
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Address the binary binds to
    pub bind_addr: SocketAddr,

    /// Capacity of a single read; one read becomes at most one message
    pub read_buffer_size: usize,

    /// Capacity of the shared message queue
    pub queue_capacity: usize,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// Maximum delivery passes running at once (0 = unlimited)
    pub max_inflight_deliveries: usize,

    /// Consecutive read errors tolerated before the connection is closed (0 = unlimited)
    pub max_consecutive_read_errors: u32,

    /// End every connection's read loop when shutdown fires
    pub close_connections_on_shutdown: bool,

    /// Enable TCP_NODELAY on accepted sockets
    pub tcp_nodelay: bool,

    /// Milliseconds a write to one peer may take before it counts as failed
    pub write_timeout_ms: u64,

    /// Milliseconds allowed for delivering queued messages after shutdown
    pub shutdown_drain_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_connections: 0,         // Unlimited
            max_inflight_deliveries: 0, // Unlimited
            max_consecutive_read_errors: DEFAULT_MAX_CONSECUTIVE_READ_ERRORS,
            close_connections_on_shutdown: true,
            tcp_nodelay: true,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT.as_millis() as u64,
            shutdown_drain_timeout_ms: DEFAULT_SHUTDOWN_DRAIN_TIMEOUT.as_millis() as u64,
        }
    }
}

impl RelayConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Parse a config from JSON and validate it
    pub fn from_json_str(json: &str) -> Result<Self, RelayError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RelayError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Reject values the relay cannot run with
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.read_buffer_size == 0 {
            return Err(RelayError::InvalidConfig(
                "read_buffer_size must be greater than 0".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(RelayError::InvalidConfig(
                "queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.write_timeout_ms == 0 {
            return Err(RelayError::InvalidConfig(
                "write_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Per-peer write limit
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Shutdown drain limit
    pub fn shutdown_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_drain_timeout_ms)
    }

    /// Set the per-peer write limit
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the shutdown drain limit
    pub fn with_shutdown_drain_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_drain_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set read chunk size
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set message queue capacity
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set maximum concurrent delivery passes
    pub fn max_inflight_deliveries(mut self, max: usize) -> Self {
        self.max_inflight_deliveries = max;
        self
    }

    /// Set the consecutive read error limit
    pub fn max_consecutive_read_errors(mut self, max: u32) -> Self {
        self.max_consecutive_read_errors = max;
        self
    }

    /// Leave connections running after shutdown until they end on their own
    pub fn keep_connections_on_shutdown(mut self) -> Self {
        self.close_connections_on_shutdown = false;
        self
    }
}
