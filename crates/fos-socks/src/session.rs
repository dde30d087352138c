//! Connection Session
//!
//! Drives one accepted client from handshake to close. The session owns the
//! Source endpoint, the Sink endpoint once a request arrived, and the node
//! chain between them; nothing is shared with other connections.
//!
//! # Event loop
//!
//! ```text
//! loop:
//!   settle()                       pump Middle nodes, apply close rules
//!   interest = predicates          (None ⇒ socket not polled)
//!   select! {
//!     client ready  ⇒ read, then write callback
//!     server ready  ⇒ read, then write callback
//!     dial finished ⇒ Sink CONNECTED / CLOSED
//!     deadline      ⇒ handshake timeout (CLIENT_HELLO* only)
//!   }
//! ```
//!
//! The runtime's I/O driver is the reactor: a socket with no interest is
//! simply never awaited, which is how a full buffer throttles its producer.

use crate::chain::{Chain, Direction};
use crate::config::{MiddleKind, ProxyConfig};
use crate::endpoint::{ConnState, Endpoint, SocketIo, SourceEndpoint, SourceEvent};
use crate::error::{ProtocolError, SocksError};
use crate::handshake::{Destination, Request, SocksState};
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Unique identifier for a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Bytes relayed by one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Client to destination
    pub bytes_down: u64,
    /// Destination to client
    pub bytes_up: u64,
}

type DialFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

/// State of one proxied connection
#[derive(Debug)]
pub struct Session {
    id: ConnectionId,
    config: Arc<ProxyConfig>,
    source: SourceEndpoint,
    sink: Option<Endpoint>,
    chain: Option<Chain>,
    /// `host:port` of the requested destination
    target: Option<String>,
    stats: SessionStats,
}

impl Session {
    pub fn new(id: ConnectionId, config: Arc<ProxyConfig>) -> Self {
        let source = SourceEndpoint::new(config.block_size, config.max_request_len);
        Self {
            id,
            config,
            source,
            sink: None,
            chain: None,
            target: None,
            stats: SessionStats::default(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn socks_state(&self) -> SocksState {
        self.source.socks_state()
    }

    pub fn sink_state(&self) -> Option<ConnState> {
        self.sink.as_ref().map(Endpoint::state)
    }

    /// Both sides are closed (or the destination was never dialed).
    pub fn is_finished(&self) -> bool {
        !self.source.is_open() && self.sink.as_ref().is_none_or(Endpoint::is_closed)
    }

    fn relaying(&self) -> bool {
        self.source.is_open() && self.source.socks_state() == SocksState::Relay
    }

    fn sink_closed(&self) -> bool {
        self.sink.as_ref().is_some_and(Endpoint::is_closed)
    }

    /// Readiness the client socket should be polled for.
    pub fn client_interest(&self) -> Option<Interest> {
        // Nothing read from the client can be delivered once the destination is gone
        let readable = self.source.is_readable(self.chain.as_ref()) && !self.sink_closed();
        let writable = self.source.is_writable(self.chain.as_ref(), self.sink_state());
        interest(readable, writable)
    }

    /// Readiness the destination socket should be polled for.
    pub fn server_interest(&self) -> Option<Interest> {
        let (Some(sink), Some(chain)) = (self.sink.as_ref(), self.chain.as_ref()) else {
            return None;
        };
        // Destination bytes wait until the client has its reply
        let readable = sink.is_readable(chain) && self.relaying();
        interest(readable, sink.is_writable(chain))
    }

    /// Client socket callbacks. Returns the request to dial, if one completed.
    pub fn on_client_ready(&mut self, io: &mut impl SocketIo, ready: Ready) -> Option<Request> {
        let mut request = None;

        if ready.is_readable() && self.source.is_readable(self.chain.as_ref()) {
            let result = self.source.on_readable(io, self.chain.as_mut());
            request = self.handle_source(result, Direction::Downstream);
        }

        let sink_state = self.sink_state();
        if ready.is_writable() && self.source.is_writable(self.chain.as_ref(), sink_state) {
            let result = self.source.on_writable(io, self.chain.as_mut(), sink_state);
            self.handle_source(result, Direction::Upstream);
        }

        request
    }

    /// Destination socket callbacks.
    pub fn on_server_ready(&mut self, io: &mut impl SocketIo, ready: Ready) {
        let relaying = self.relaying();
        let (Some(sink), Some(chain)) = (self.sink.as_mut(), self.chain.as_mut()) else {
            return;
        };

        if ready.is_readable() && relaying && sink.is_readable(chain) {
            if let Err(err) = sink.on_readable(io, chain) {
                log_close(self.id, "destination", &err);
            }
        }

        if ready.is_writable() && sink.is_writable(chain) {
            match sink.on_writable(io, chain) {
                Ok(n) => self.stats.bytes_down += n as u64,
                Err(err) => log_close(self.id, "destination", &err),
            }
        }
    }

    fn handle_source(
        &mut self,
        result: Result<SourceEvent, SocksError>,
        dir: Direction,
    ) -> Option<Request> {
        match result {
            Ok(SourceEvent::Idle) => None,
            Ok(SourceEvent::Request(request)) => {
                debug!(
                    conn = %self.id,
                    target = %request.target(),
                    user = %request.user_id,
                    "request parsed"
                );
                self.attach_sink(&request);
                Some(request)
            }
            Ok(SourceEvent::Rejected(err)) => {
                warn!(conn = %self.id, "handshake rejected: {}", SocksError::Protocol(err));
                None
            }
            Ok(SourceEvent::Replied(SocksState::Relay)) => {
                debug!(conn = %self.id, "request granted, relaying");
                None
            }
            Ok(SourceEvent::Replied(_)) => {
                debug!(conn = %self.id, "request denied, closing");
                None
            }
            Ok(SourceEvent::Relayed(n)) => {
                // Reads from the client are counted here, writes to the
                // destination in `on_server_ready`
                if dir == Direction::Upstream {
                    self.stats.bytes_up += n as u64;
                }
                None
            }
            Err(err) => {
                log_close(self.id, "client", &err);
                None
            }
        }
    }

    /// Build the chain and the connecting Sink for a completed request.
    fn attach_sink(&mut self, request: &Request) {
        let transforms = self.config.middles.iter().map(MiddleKind::build).collect();
        let mut chain = Chain::new(self.config.buffer_capacity, self.config.block_size, transforms);

        if chain.middle_count() > 0 {
            debug!(conn = %self.id, middles = ?chain.transform_names(), "chain assembled");
        }

        let mut early = self.source.handshake_mut().take_early_data();
        if !early.is_empty() {
            let stored = chain.forward_down(chain.source(), &mut early);
            if stored < early.len() {
                warn!(conn = %self.id, "dropped {} early bytes", early.len() - stored);
            }
        }

        self.sink = Some(Endpoint::sink(chain.sink(), self.config.block_size));
        self.chain = Some(chain);
        self.target = Some(request.target());
    }

    /// Destination connect finished.
    pub fn on_connect_result(&mut self, result: io::Result<()>) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let target = self.target.clone().unwrap_or_default();

        match result {
            Ok(()) => {
                sink.on_connected();
                debug!(conn = %self.id, %target, "destination connected");
            }
            Err(source) => {
                sink.on_connect_failed();
                let err = SocksError::ConnectFailure {
                    destination: target,
                    source,
                };
                warn!(conn = %self.id, "{}", err);
            }
        }
    }

    /// Handshake deadline expired.
    pub fn on_handshake_timeout(&mut self) {
        if self.source.socks_state().is_negotiating() {
            let err = SocksError::Protocol(ProtocolError::Timeout);
            warn!(conn = %self.id, "handshake rejected: {}", err);
            self.source.reject();
        }
    }

    /// Pump Middle nodes and apply the drain-then-close rules.
    pub fn settle(&mut self) {
        if let Some(chain) = self.chain.as_mut() {
            chain.pump();
        }

        let (Some(sink), Some(chain)) = (self.sink.as_mut(), self.chain.as_mut()) else {
            return;
        };

        if !self.source.is_open() {
            // Client gone: flush what is headed for the destination, then close
            chain.discard(Direction::Upstream);
            match sink.state() {
                ConnState::New | ConnState::Connecting => sink.close(),
                ConnState::Connected if chain.is_drained(Direction::Downstream) => {
                    debug!(conn = %self.id, "client closed, destination drained");
                    sink.close();
                }
                _ => {}
            }
        } else if sink.is_closed() && self.source.socks_state() == SocksState::Relay {
            // Destination gone: flush what is headed for the client, then close
            chain.discard(Direction::Downstream);
            if chain.is_drained(Direction::Upstream) {
                debug!(conn = %self.id, "destination closed, client drained");
                self.source.close();
            }
        }
    }

    /// Run the session to completion on `client`.
    pub async fn run(mut self, client: TcpStream) -> SessionStats {
        let mut client = Some(client);
        let mut server: Option<TcpStream> = None;
        let mut dial: Option<DialFuture> = None;

        let deadline = tokio::time::sleep(self.config.handshake_timeout());
        tokio::pin!(deadline);

        loop {
            self.settle();

            // Dropping a stream closes its socket
            if !self.source.is_open() {
                client = None;
            }
            if self.sink_closed() {
                server = None;
                dial = None;
            }
            if self.is_finished() {
                break;
            }

            let client_interest = self.client_interest();
            let server_interest = self.server_interest();

            tokio::select! {
                ready = wait_ready(client.as_ref(), client_interest) => {
                    let Some(stream) = client.as_mut() else { continue };
                    match ready {
                        Ok(ready) => {
                            if let Some(request) = self.on_client_ready(stream, ready) {
                                dial = Some(dial_destination(&request, self.config.connect_timeout()));
                            }
                        }
                        Err(err) => {
                            log_close(self.id, "client", &err.into());
                            self.source.close();
                        }
                    }
                }
                ready = wait_ready(server.as_ref(), server_interest) => {
                    let Some(stream) = server.as_mut() else { continue };
                    match ready {
                        Ok(ready) => self.on_server_ready(stream, ready),
                        Err(err) => {
                            log_close(self.id, "destination", &err.into());
                            if let Some(sink) = self.sink.as_mut() {
                                sink.close();
                            }
                        }
                    }
                }
                result = wait_dial(&mut dial) => {
                    dial = None;
                    match result {
                        Ok(stream) => {
                            server = Some(stream);
                            self.on_connect_result(Ok(()));
                        }
                        Err(err) => self.on_connect_result(Err(err)),
                    }
                }
                _ = &mut deadline, if self.source.socks_state().is_negotiating() => {
                    self.on_handshake_timeout();
                }
            }
        }

        info!(
            conn = %self.id,
            target = self.target.as_deref().unwrap_or("-"),
            bytes_down = self.stats.bytes_down,
            bytes_up = self.stats.bytes_up,
            "session closed"
        );
        self.stats
    }
}

fn interest(readable: bool, writable: bool) -> Option<Interest> {
    match (readable, writable) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

fn log_close(id: ConnectionId, side: &str, err: &SocksError) {
    if err.is_peer_closed() {
        debug!(conn = %id, "{} closed the connection", side);
    } else {
        warn!(conn = %id, "{} error: {}", side, err);
    }
}

/// Wait for readiness, or forever if there is nothing to wait for.
async fn wait_ready(stream: Option<&TcpStream>, interest: Option<Interest>) -> io::Result<Ready> {
    match (stream, interest) {
        (Some(stream), Some(interest)) => stream.ready(interest).await,
        _ => std::future::pending().await,
    }
}

async fn wait_dial(dial: &mut Option<DialFuture>) -> io::Result<TcpStream> {
    match dial {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

/// Connect to the requested destination; domain names go through the
/// system resolver.
fn dial_destination(request: &Request, timeout: Duration) -> DialFuture {
    let destination = request.destination.clone();
    let port = request.port;

    Box::pin(async move {
        let connect = async {
            match &destination {
                Destination::Ip(ip) => TcpStream::connect(SocketAddr::from((*ip, port))).await,
                Destination::Domain(name) => TcpStream::connect((name.as_str(), port)).await,
            }
        };

        connect_within(timeout, connect).await
    })
}

/// Bound a connect attempt; expiry surfaces as `TimedOut`.
async fn connect_within<F>(timeout: Duration, connect: F) -> io::Result<TcpStream>
where
    F: Future<Output = io::Result<TcpStream>>,
{
    match tokio::time::timeout(timeout, connect).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
    }
}
