//! Endpoints
//!
//! An [`Endpoint`] is one non-blocking socket attached to an end node of a
//! [`Chain`]. It answers the two readiness questions the reactor asks before
//! polling (`is_readable`, `is_writable`) and performs one best-effort
//! transfer per callback.
//!
//! # Flow control
//!
//! - Readable only while the neighbor receiving our reads has free space.
//!   A full neighbor parks the socket and the kernel receive buffer absorbs
//!   the stall.
//! - Writable only while the node's egress buffer holds data. Sends peek,
//!   and only the bytes the socket accepted are consumed.
//!
//! [`SourceEndpoint`] layers the SOCKS handshake over the client-facing
//! endpoint.

use crate::chain::{Chain, NodeId};
use crate::error::{ProtocolError, SocksError, is_transient_io};
use crate::handshake::{Handshake, Request, SocksState};
use std::io;
use tokio::net::TcpStream;

/// Connection lifecycle of one socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    New,
    /// Non-blocking connect issued
    Connecting,
    Connected,
    Closed,
}

/// Non-blocking socket operations used by endpoints.
///
/// Both calls return immediately; `WouldBlock` means "not ready" and
/// `Ok(0)` from `recv` means the peer shut down.
pub trait SocketIo {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn send(&mut self, data: &[u8]) -> io::Result<usize>;
}

impl SocketIo for TcpStream {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.try_read(buf)
    }

    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        self.try_write(data)
    }
}

/// Which end of the chain a socket serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client-facing
    Source,
    /// Destination-facing
    Sink,
}

/// A socket bound to an end node of a chain.
#[derive(Debug)]
pub struct Endpoint {
    role: Role,
    node: NodeId,
    state: ConnState,
    /// Holds one block between the socket and the chain
    scratch: Vec<u8>,
}

impl Endpoint {
    pub fn new(role: Role, node: NodeId, block_size: usize) -> Self {
        Self {
            role,
            node,
            state: ConnState::New,
            scratch: vec![0u8; block_size.max(1)],
        }
    }

    /// Client-facing endpoint; connected as soon as it was accepted.
    pub fn source(node: NodeId, block_size: usize) -> Self {
        let mut endpoint = Self::new(Role::Source, node, block_size);
        endpoint.state = ConnState::Connected;
        endpoint
    }

    /// Destination-facing endpoint with its connect in flight.
    pub fn sink(node: NodeId, block_size: usize) -> Self {
        let mut endpoint = Self::new(Role::Sink, node, block_size);
        endpoint.state = ConnState::Connecting;
        endpoint
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    /// Room available for bytes this socket reads
    fn read_room(&self, chain: &Chain) -> usize {
        match self.role {
            Role::Source => chain.avail_down(self.node),
            Role::Sink => chain.avail_up(self.node),
        }
    }

    pub fn is_readable(&self, chain: &Chain) -> bool {
        self.is_open() && self.read_room(chain) > 0
    }

    pub fn is_writable(&self, chain: &Chain) -> bool {
        self.is_open() && !chain.egress(self.node).is_empty()
    }

    /// Read up to `limit` bytes into the scratch block.
    ///
    /// `Ok(0)` means nothing was available. EOF and hard errors close the
    /// endpoint and come back as errors for the caller to log.
    fn recv_block(&mut self, io: &mut impl SocketIo, limit: usize) -> Result<usize, SocksError> {
        let limit = limit.min(self.scratch.len());
        if !self.is_open() || limit == 0 {
            return Ok(0);
        }

        match io.recv(&mut self.scratch[..limit]) {
            Ok(0) => {
                self.state = ConnState::Closed;
                Err(SocksError::PeerClosed)
            }
            Ok(n) => Ok(n),
            Err(e) if is_transient_io(&e) => Ok(0),
            Err(e) => {
                self.state = ConnState::Closed;
                Err(e.into())
            }
        }
    }

    /// Send as much of `data` as the socket takes.
    fn send_bytes(&mut self, io: &mut impl SocketIo, data: &[u8]) -> Result<usize, SocksError> {
        if !self.is_open() || data.is_empty() {
            return Ok(0);
        }

        match io.send(data) {
            Ok(n) => Ok(n),
            Err(e) if is_transient_io(&e) => Ok(0),
            Err(e) => {
                self.state = ConnState::Closed;
                Err(e.into())
            }
        }
    }

    /// Read callback: socket into the neighbor node.
    pub fn on_readable(&mut self, io: &mut impl SocketIo, chain: &mut Chain) -> Result<usize, SocksError> {
        let room = self.read_room(chain);
        let n = self.recv_block(io, room)?;
        if n == 0 {
            return Ok(0);
        }

        let data = &mut self.scratch[..n];
        let stored = match self.role {
            Role::Source => chain.forward_down(self.node, data),
            Role::Sink => chain.forward_up(self.node, data),
        };
        debug_assert_eq!(stored, n, "reads are bounded by neighbor space");
        Ok(stored)
    }

    /// Write callback: egress buffer into the socket.
    pub fn on_writable(&mut self, io: &mut impl SocketIo, chain: &mut Chain) -> Result<usize, SocksError> {
        if !self.is_open() {
            return Ok(0);
        }

        let n = chain.egress(self.node).peek(&mut self.scratch);
        if n == 0 {
            return Ok(0);
        }

        let block = std::mem::take(&mut self.scratch);
        let result = self.send_bytes(io, &block[..n]);
        self.scratch = block;

        let sent = result?;
        chain.egress_mut(self.node).consume(sent);
        Ok(sent)
    }

    /// Connect completed.
    pub fn on_connected(&mut self) {
        if self.state == ConnState::Connecting {
            self.state = ConnState::Connected;
        }
    }

    /// Connect failed or timed out.
    pub fn on_connect_failed(&mut self) {
        self.state = ConnState::Closed;
    }

    pub fn close(&mut self) {
        self.state = ConnState::Closed;
    }
}

/// What a Source endpoint callback produced
#[derive(Debug)]
pub enum SourceEvent {
    /// Nothing to act on
    Idle,
    /// Handshake complete; the destination should be dialed
    Request(Request),
    /// Handshake failed; a denied reply is queued
    Rejected(ProtocolError),
    /// Reply fully sent; carries the state it led to
    Replied(SocksState),
    /// Payload bytes moved
    Relayed(usize),
}

/// Client-facing endpoint running the SOCKS handshake before relaying.
#[derive(Debug)]
pub struct SourceEndpoint {
    endpoint: Endpoint,
    handshake: Handshake,
}

impl SourceEndpoint {
    /// The Source is always the chain head.
    pub fn new(block_size: usize, max_request_len: usize) -> Self {
        Self {
            endpoint: Endpoint::source(NodeId(0), block_size),
            handshake: Handshake::new(max_request_len),
        }
    }

    pub fn state(&self) -> ConnState {
        self.endpoint.state()
    }

    pub fn socks_state(&self) -> SocksState {
        self.handshake.state()
    }

    pub fn is_open(&self) -> bool {
        self.endpoint.is_open()
    }

    pub fn handshake_mut(&mut self) -> &mut Handshake {
        &mut self.handshake
    }

    pub fn is_readable(&self, chain: Option<&Chain>) -> bool {
        if !self.is_open() {
            return false;
        }

        match self.handshake.state() {
            SocksState::ClientHello | SocksState::ClientHelloDomainName => {
                self.handshake.read_budget() > 0
            }
            SocksState::Relay => chain.is_some_and(|c| self.endpoint.is_readable(c)),
            _ => false,
        }
    }

    /// In `WaitConnect` the Source only wakes once the Sink settled.
    pub fn is_writable(&self, chain: Option<&Chain>, sink: Option<ConnState>) -> bool {
        if !self.is_open() {
            return false;
        }

        match self.handshake.state() {
            SocksState::WaitConnect => {
                matches!(sink, Some(ConnState::Connected | ConnState::Closed))
            }
            SocksState::ServerHelloOpen | SocksState::ServerHelloClose => true,
            SocksState::Relay => chain.is_some_and(|c| self.endpoint.is_writable(c)),
            _ => false,
        }
    }

    pub fn on_readable(
        &mut self,
        io: &mut impl SocketIo,
        chain: Option<&mut Chain>,
    ) -> Result<SourceEvent, SocksError> {
        match self.handshake.state() {
            SocksState::ClientHello | SocksState::ClientHelloDomainName => {
                let budget = self.handshake.read_budget();
                let n = self.endpoint.recv_block(io, budget)?;
                if n == 0 {
                    return Ok(SourceEvent::Idle);
                }

                match self.handshake.receive(&self.endpoint.scratch[..n]) {
                    Ok(Some(request)) => Ok(SourceEvent::Request(request)),
                    Ok(None) => Ok(SourceEvent::Idle),
                    Err(err) => Ok(SourceEvent::Rejected(err)),
                }
            }
            SocksState::Relay => match chain {
                Some(chain) => self.endpoint.on_readable(io, chain).map(SourceEvent::Relayed),
                None => Ok(SourceEvent::Idle),
            },
            _ => Ok(SourceEvent::Idle),
        }
    }

    pub fn on_writable(
        &mut self,
        io: &mut impl SocketIo,
        chain: Option<&mut Chain>,
        sink: Option<ConnState>,
    ) -> Result<SourceEvent, SocksError> {
        if self.handshake.state() == SocksState::WaitConnect {
            match sink {
                Some(ConnState::Connected) => self.handshake.connect_outcome(true),
                Some(ConnState::Closed) => self.handshake.connect_outcome(false),
                _ => return Ok(SourceEvent::Idle),
            }
        }

        match self.handshake.state() {
            SocksState::ServerHelloOpen | SocksState::ServerHelloClose => {
                let sent = self.endpoint.send_bytes(io, self.handshake.pending_reply())?;
                self.handshake.reply_sent(sent);

                match self.handshake.state() {
                    SocksState::Close => {
                        self.endpoint.close();
                        Ok(SourceEvent::Replied(SocksState::Close))
                    }
                    SocksState::Relay => Ok(SourceEvent::Replied(SocksState::Relay)),
                    _ => Ok(SourceEvent::Idle),
                }
            }
            SocksState::Relay => match chain {
                Some(chain) => self.endpoint.on_writable(io, chain).map(SourceEvent::Relayed),
                None => Ok(SourceEvent::Idle),
            },
            _ => Ok(SourceEvent::Idle),
        }
    }

    /// Abort the handshake with a denied reply (e.g. on timeout).
    pub fn reject(&mut self) {
        self.handshake.reject();
    }

    pub fn close(&mut self) {
        self.endpoint.close();
        self.handshake.close();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::handshake::{Destination, Reply};
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;

    /// In-memory socket: scripted reads, capped writes.
    #[derive(Debug, Default)]
    pub(crate) struct MockIo {
        pub input: VecDeque<Vec<u8>>,
        pub eof: bool,
        pub output: Vec<u8>,
        /// Bytes accepted per send; `None` means unlimited
        pub send_limit: Option<usize>,
        pub send_error: Option<io::ErrorKind>,
    }

    impl MockIo {
        pub(crate) fn with_input(chunks: &[&[u8]]) -> Self {
            Self {
                input: chunks.iter().map(|c| c.to_vec()).collect(),
                ..Self::default()
            }
        }
    }

    impl SocketIo for MockIo {
        fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.input.pop_front() {
                Some(mut chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.input.push_front(chunk.split_off(n));
                    }
                    Ok(n)
                }
                None if self.eof => Ok(0),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }

        fn send(&mut self, data: &[u8]) -> io::Result<usize> {
            if let Some(kind) = self.send_error {
                return Err(kind.into());
            }
            let n = self.send_limit.map_or(data.len(), |limit| limit.min(data.len()));
            if n == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.output.extend_from_slice(&data[..n]);
            Ok(n)
        }
    }

    fn connected_pair(chain: &Chain, block: usize) -> (Endpoint, Endpoint) {
        let source = Endpoint::source(chain.source(), block);
        let mut sink = Endpoint::sink(chain.sink(), block);
        sink.on_connected();
        (source, sink)
    }

    #[test]
    fn test_sink_lifecycle() {
        let chain = Chain::direct(8, 4);
        let mut sink = Endpoint::sink(chain.sink(), 4);

        assert_eq!(sink.state(), ConnState::Connecting);
        assert!(!sink.is_readable(&chain));
        assert!(!sink.is_writable(&chain));

        sink.on_connected();
        assert_eq!(sink.state(), ConnState::Connected);
        assert!(sink.is_readable(&chain));

        let mut failed = Endpoint::sink(chain.sink(), 4);
        failed.on_connect_failed();
        assert!(failed.is_closed());
        assert_eq!(Endpoint::new(Role::Sink, chain.sink(), 4).state(), ConnState::New);
    }

    #[test]
    fn test_backpressure_parks_reader_until_sink_drains() {
        let mut chain = Chain::direct(8, 4);
        let (mut source, mut sink) = connected_pair(&chain, 4);
        let mut client = MockIo::with_input(&[&b"0123456789ab"[..]]);
        let mut server = MockIo {
            send_limit: Some(3),
            ..MockIo::default()
        };

        assert_eq!(source.on_readable(&mut client, &mut chain).unwrap(), 4);
        assert_eq!(source.on_readable(&mut client, &mut chain).unwrap(), 4);

        // Sink outbound is full: the source must not be polled for reads
        assert!(chain.egress(chain.sink()).is_full());
        assert!(!source.is_readable(&chain));
        assert!(sink.is_writable(&chain));

        assert_eq!(sink.on_writable(&mut server, &mut chain).unwrap(), 3);
        assert_eq!(server.output, b"012");
        assert!(source.is_readable(&chain));

        assert_eq!(source.on_readable(&mut client, &mut chain).unwrap(), 3);
        assert!(!source.is_readable(&chain));
    }

    #[test]
    fn test_partial_send_consumes_only_what_was_sent() {
        let mut chain = Chain::direct(16, 8);
        let (_, mut sink) = connected_pair(&chain, 8);
        let mut server = MockIo {
            send_limit: Some(2),
            ..MockIo::default()
        };

        chain.forward_down(chain.source(), &mut b"abcdef".to_vec());
        assert_eq!(sink.on_writable(&mut server, &mut chain).unwrap(), 2);
        assert_eq!(chain.egress(chain.sink()).avail_read(), 4);
        assert_eq!(sink.on_writable(&mut server, &mut chain).unwrap(), 2);
        assert_eq!(server.output, b"abcd");

        // Socket full: nothing consumed
        server.send_limit = Some(0);
        assert_eq!(sink.on_writable(&mut server, &mut chain).unwrap(), 0);
        assert_eq!(chain.egress(chain.sink()).avail_read(), 2);
    }

    #[test]
    fn test_upstream_relay_from_sink() {
        let mut chain = Chain::direct(16, 8);
        let (mut source, mut sink) = connected_pair(&chain, 8);
        let mut server = MockIo::with_input(&[&b"response"[..]]);
        let mut client = MockIo::default();

        assert_eq!(sink.on_readable(&mut server, &mut chain).unwrap(), 8);
        assert!(source.is_writable(&chain));
        assert_eq!(source.on_writable(&mut client, &mut chain).unwrap(), 8);
        assert_eq!(client.output, b"response");
        assert!(!source.is_writable(&chain));
    }

    #[test]
    fn test_would_block_is_not_an_error() {
        let mut chain = Chain::direct(8, 4);
        let (mut source, _) = connected_pair(&chain, 4);
        let mut client = MockIo::default();

        assert_eq!(source.on_readable(&mut client, &mut chain).unwrap(), 0);
        assert!(source.is_open());
    }

    #[test]
    fn test_eof_closes_endpoint() {
        let mut chain = Chain::direct(8, 4);
        let (mut source, _) = connected_pair(&chain, 4);
        let mut client = MockIo {
            eof: true,
            ..MockIo::default()
        };

        let err = source.on_readable(&mut client, &mut chain).unwrap_err();
        assert!(err.is_peer_closed());
        assert!(source.is_closed());
        assert!(!source.is_readable(&chain));
    }

    #[test]
    fn test_send_failure_closes_endpoint() {
        let mut chain = Chain::direct(8, 4);
        let (_, mut sink) = connected_pair(&chain, 4);
        let mut server = MockIo {
            send_error: Some(io::ErrorKind::ConnectionReset),
            ..MockIo::default()
        };

        chain.forward_down(chain.source(), &mut b"data".to_vec());
        let err = sink.on_writable(&mut server, &mut chain).unwrap_err();
        assert!(matches!(err, SocksError::Io(_)));
        assert!(sink.is_closed());
        assert_eq!(chain.egress(chain.sink()).avail_read(), 4);
    }

    fn request_bytes() -> Vec<u8> {
        Request::connect(Destination::Ip(Ipv4Addr::LOCALHOST), 8080).encode()
    }

    #[test]
    fn test_source_handshake_then_granted_reply() {
        let wire = request_bytes();
        let (head, tail) = wire.split_at(5);
        let mut client = MockIo::with_input(&[head, tail]);
        client.send_limit = Some(5);
        let mut source = SourceEndpoint::new(16, 64);

        assert!(source.is_readable(None));
        assert!(matches!(source.on_readable(&mut client, None).unwrap(), SourceEvent::Idle));
        let request = match source.on_readable(&mut client, None).unwrap() {
            SourceEvent::Request(request) => request,
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(request.target(), "127.0.0.1:8080");
        assert_eq!(source.socks_state(), SocksState::WaitConnect);
        assert!(!source.is_readable(None));

        // Still connecting: nothing to write yet
        assert!(!source.is_writable(None, Some(ConnState::Connecting)));
        assert!(source.is_writable(None, Some(ConnState::Connected)));

        let event = source.on_writable(&mut client, None, Some(ConnState::Connected)).unwrap();
        assert!(matches!(event, SourceEvent::Idle));
        assert_eq!(source.socks_state(), SocksState::ServerHelloOpen);

        let event = source.on_writable(&mut client, None, Some(ConnState::Connected)).unwrap();
        assert!(matches!(event, SourceEvent::Replied(SocksState::Relay)));
        assert_eq!(client.output, Reply::Granted.encode());
        assert!(source.is_open());
    }

    #[test]
    fn test_source_denied_reply_closes() {
        let wire = request_bytes();
        let mut client = MockIo::with_input(&[wire.as_slice()]);
        let mut source = SourceEndpoint::new(16, 64);

        assert!(matches!(source.on_readable(&mut client, None).unwrap(), SourceEvent::Request(_)));
        let event = source.on_writable(&mut client, None, Some(ConnState::Closed)).unwrap();

        assert!(matches!(event, SourceEvent::Replied(SocksState::Close)));
        assert_eq!(client.output, Reply::Denied.encode());
        assert_eq!(source.state(), ConnState::Closed);
    }

    #[test]
    fn test_source_rejects_bad_version() {
        let mut client = MockIo::with_input(&[&[0x05u8, 0x01, 0x00][..]]);
        let mut source = SourceEndpoint::new(16, 64);

        let event = source.on_readable(&mut client, None).unwrap();
        assert!(matches!(event, SourceEvent::Rejected(ProtocolError::UnsupportedVersion(5))));
        assert!(!source.is_readable(None));
        assert!(source.is_writable(None, None));

        source.on_writable(&mut client, None, None).unwrap();
        assert_eq!(client.output, Reply::Denied.encode());
        assert_eq!(source.socks_state(), SocksState::Close);
    }
}
