//! Error types for the SOCKS4 proxy.

use std::io;
use thiserror::Error;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, SocksError>;

/// Malformed or unsupported client handshake.
///
/// Every variant ends the handshake with a denied reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unsupported SOCKS version {0} (expected 4)")]
    UnsupportedVersion(u8),

    #[error("unsupported command 0x{0:02x}")]
    UnsupportedCommand(u8),

    #[error("request exceeds {0} bytes without terminator")]
    RequestTooLong(usize),

    #[error("empty destination domain name")]
    EmptyDomain,

    #[error("destination domain name is not valid UTF-8")]
    InvalidDomain,

    #[error("handshake not completed in time")]
    Timeout,
}

/// Proxy errors
#[derive(Debug, Error)]
pub enum SocksError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Orderly shutdown by the remote peer (zero-byte read)
    #[error("peer closed the connection")]
    PeerClosed,

    #[error("connect to {destination} failed: {source}")]
    ConnectFailure {
        destination: String,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("shutting down")]
    ShuttingDown,
}

impl SocksError {
    /// Would-block and interrupted calls mean "not ready this cycle".
    pub fn is_transient(&self) -> bool {
        match self {
            SocksError::Io(e) => is_transient_io(e),
            _ => false,
        }
    }

    /// Orderly close rather than a failure
    pub fn is_peer_closed(&self) -> bool {
        matches!(self, SocksError::PeerClosed)
    }
}

/// True for I/O errors that only mean "try again later".
pub fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("block size must be non-zero")]
    ZeroBlockSize,

    #[error("buffer capacity {capacity} is smaller than block size {block_size}")]
    BufferTooSmall { capacity: usize, block_size: usize },

    #[error("max request length {0} must be between 9 and the buffer capacity")]
    InvalidRequestLimit(usize),

    #[error("{0} must be non-zero")]
    ZeroTimeout(&'static str),

    #[error("max connections must be non-zero")]
    ZeroConnections,

    #[error("failed to read config file: {0}")]
    Read(String),

    #[error("invalid config: {0}")]
    Parse(String),
}
