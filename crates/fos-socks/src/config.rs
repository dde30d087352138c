//! Proxy Configuration
//!
//! Listener, buffer, and timeout settings plus the Middle-node line-up.
//! Loadable from TOML; every field has a default so a file only needs the
//! values it changes:
//!
//! ```toml
//! listen_addr = "0.0.0.0:1080"
//! handshake_timeout_ms = 5000
//! middles = ["uppercase"]
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Bytes moved per read or write callback
pub const BLOCK_SIZE: usize = 8192;

/// Standard SOCKS port
pub const DEFAULT_PORT: u16 = 1080;

/// Named transform for a Middle node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MiddleKind {
    /// Forward unchanged
    PassThrough,
    /// Uppercase client-to-destination ASCII
    Uppercase,
}

/// Proxy configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listen address (all interfaces by default)
    pub listen_addr: SocketAddr,
    /// Maximum bytes moved per socket callback
    pub block_size: usize,
    /// Capacity of every ring buffer in a chain
    pub buffer_capacity: usize,
    /// Request bytes accepted before the handshake is rejected
    pub max_request_len: usize,
    /// Time a client has to complete its request (milliseconds)
    pub handshake_timeout_ms: u64,
    /// Time allowed for the destination connect (milliseconds)
    pub connect_timeout_ms: u64,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Listen backlog
    pub backlog: u32,
    /// Middle nodes, client side first
    pub middles: Vec<MiddleKind>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            block_size: BLOCK_SIZE,
            buffer_capacity: BLOCK_SIZE * 2,
            max_request_len: 1024,
            handshake_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            max_connections: 1024,
            backlog: 128,
            middles: Vec::new(),
        }
    }
}

impl ProxyConfig {
    /// Default configuration listening on all interfaces at `port`
    pub fn with_port(port: u16) -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            ..Self::default()
        }
    }

    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Worst-case buffer memory per connection
    pub fn memory_estimate(&self) -> usize {
        // Source and Sink own one ring each, every Middle owns two
        let rings = 2 + 2 * self.middles.len();
        rings * self.buffer_capacity + 3 * self.block_size + self.max_request_len
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 {
            return Err(ConfigError::ZeroBlockSize);
        }
        if self.buffer_capacity < self.block_size {
            return Err(ConfigError::BufferTooSmall {
                capacity: self.buffer_capacity,
                block_size: self.block_size,
            });
        }
        if self.max_request_len < 9 || self.max_request_len > self.buffer_capacity {
            return Err(ConfigError::InvalidRequestLimit(self.max_request_len));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("handshake_timeout_ms"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("connect_timeout_ms"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::ZeroConnections);
        }
        Ok(())
    }
}
