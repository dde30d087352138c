//! fOS SOCKS - SOCKS4/SOCKS4a Proxy Core
//!
//! A TCP proxy that speaks the server side of SOCKS4 and SOCKS4a, connects
//! to the requested destination, and relays bytes both ways through a chain
//! of bounded ring buffers.
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────────── Session (one per client) ────────────────────┐
//!            │                                                                   │
//!  client ◀─▶│ Source ──▶ [Middle ──▶ Middle ...] ──▶ Sink │◀─▶ destination
//!   socket   │ endpoint      downstream (uppercase, ...)      endpoint │   socket
//!            │        ◀──────────── upstream ◀────────────              │
//!            └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **SOCKS4 + 4a**: IPv4 destinations and proxy-side name resolution
//! - **Backpressure**: a socket is only polled while its buffer has room
//! - **Drain-then-close**: buffered bytes reach the surviving peer first
//! - **Pluggable Middles**: in-place transforms between Source and Sink
//! - **Strict handshake**: malformed requests get a denied reply
//!
//! # Example
//!
//! ```no_run
//! use fos_socks::{ProxyConfig, Socks4Server};
//!
//! # async fn start() -> fos_socks::Result<()> {
//! let server = Socks4Server::bind(ProxyConfig::with_port(1080)).await?;
//! server.run().await
//! # }
//! ```

mod chain;
mod config;
mod endpoint;
mod error;
mod handshake;
mod listener;
mod ring;
mod session;

pub use chain::{Chain, Direction, Node, NodeId, PassThrough, Transform, Uppercase};
pub use config::{BLOCK_SIZE, DEFAULT_PORT, MiddleKind, ProxyConfig};
pub use endpoint::{ConnState, Endpoint, Role, SocketIo, SourceEndpoint, SourceEvent};
pub use error::{ConfigError, ProtocolError, Result, SocksError, is_transient_io};
pub use handshake::{
    Command, Destination, Handshake, REPLY_LEN, Reply, Request, SOCKS4_VERSION, SocksState,
};
pub use listener::Socks4Server;
pub use ring::RingBuffer;
pub use session::{ConnectionId, Session, SessionStats};
