//! SOCKS4 / SOCKS4a Handshake
//!
//! Server side of the request/reply exchange, written as a sans-IO state
//! machine: the Source endpoint feeds it whatever bytes each read produced
//! and sends whatever reply bytes it hands back.
//!
//! # Wire format
//!
//! ```text
//! request:  VN(1)=4 | CD(1) | DSTPORT(2) | DSTIP(4) | USERID... | 0x00
//! 4a:       ... DSTIP = 0.0.0.x (x != 0) ... | DOMAIN... | 0x00
//! reply:    0x00 | CD(1) 0x5a/0x5b | 0x0000 | 0x00000000
//! ```
//!
//! # States
//!
//! ```text
//! ClientHello ─▶ [ClientHelloDomainName] ─▶ WaitConnect ─┬▶ ServerHelloOpen ─▶ Relay
//!      │                  │                              └▶ ServerHelloClose ─▶ Close
//!      └──────────────────┴──── protocol error ─────────────▶ ServerHelloClose
//! ```

use crate::error::ProtocolError;
use std::fmt;
use std::net::Ipv4Addr;

/// SOCKS protocol version handled here
pub const SOCKS4_VERSION: u8 = 0x04;

/// Fixed request prefix: version, command, port, address
pub const REQUEST_HEADER_LEN: usize = 8;

/// Shortest valid request (header plus the user id terminator)
pub const MIN_REQUEST_LEN: usize = REQUEST_HEADER_LEN + 1;

/// Reply length
pub const REPLY_LEN: usize = 8;

const CMD_CONNECT: u8 = 0x01;
const CMD_BIND: u8 = 0x02;

const REPLY_GRANTED: u8 = 0x5a;
const REPLY_DENIED: u8 = 0x5b;

/// SOCKS session state of a Source endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksState {
    /// Reading the fixed request and user id
    ClientHello,
    /// 4a request: reading the destination domain name
    ClientHelloDomainName,
    /// Request complete, destination connect in flight
    WaitConnect,
    /// Sending the granted reply
    ServerHelloOpen,
    /// Sending the denied reply
    ServerHelloClose,
    /// Relaying payload
    Relay,
    /// Done, connection is closing
    Close,
}

impl SocksState {
    /// Still consuming the client's request
    pub fn is_negotiating(&self) -> bool {
        matches!(self, SocksState::ClientHello | SocksState::ClientHelloDomainName)
    }

    /// A reply is being sent
    pub fn is_replying(&self) -> bool {
        matches!(self, SocksState::ServerHelloOpen | SocksState::ServerHelloClose)
    }
}

/// Request command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    Unknown(u8),
}

impl From<u8> for Command {
    fn from(value: u8) -> Self {
        match value {
            CMD_CONNECT => Command::Connect,
            CMD_BIND => Command::Bind,
            other => Command::Unknown(other),
        }
    }
}

impl From<Command> for u8 {
    fn from(cmd: Command) -> Self {
        match cmd {
            Command::Connect => CMD_CONNECT,
            Command::Bind => CMD_BIND,
            Command::Unknown(other) => other,
        }
    }
}

/// Requested destination host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Ip(Ipv4Addr),
    /// SOCKS4a: resolved by the proxy
    Domain(String),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Ip(ip) => write!(f, "{}", ip),
            Destination::Domain(name) => f.write_str(name),
        }
    }
}

/// A completed client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub version: u8,
    pub command: Command,
    pub port: u16,
    pub destination: Destination,
    pub user_id: String,
}

impl Request {
    /// CONNECT request for `destination:port`
    pub fn connect(destination: Destination, port: u16) -> Self {
        Self {
            version: SOCKS4_VERSION,
            command: Command::Connect,
            port,
            destination,
            user_id: String::new(),
        }
    }

    /// `host:port` string, suitable for logging and for dialing
    pub fn target(&self) -> String {
        format!("{}:{}", self.destination, self.port)
    }

    /// Serialize as a client would send it.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MIN_REQUEST_LEN + self.user_id.len());
        out.push(self.version);
        out.push(self.command.into());
        out.extend_from_slice(&self.port.to_be_bytes());

        match &self.destination {
            Destination::Ip(ip) => {
                out.extend_from_slice(&ip.octets());
                out.extend_from_slice(self.user_id.as_bytes());
                out.push(0x00);
            }
            Destination::Domain(name) => {
                out.extend_from_slice(&[0, 0, 0, 1]);
                out.extend_from_slice(self.user_id.as_bytes());
                out.push(0x00);
                out.extend_from_slice(name.as_bytes());
                out.push(0x00);
            }
        }
        out
    }
}

/// Server reply status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Granted,
    Denied,
}

impl Reply {
    pub fn code(&self) -> u8 {
        match self {
            Reply::Granted => REPLY_GRANTED,
            Reply::Denied => REPLY_DENIED,
        }
    }

    pub fn encode(&self) -> [u8; REPLY_LEN] {
        [0x00, self.code(), 0, 0, 0, 0, 0, 0]
    }
}

/// `0.0.0.x` with `x != 0` marks a 4a request
fn is_domain_sentinel(octets: [u8; 4]) -> bool {
    octets[..3] == [0, 0, 0] && octets[3] != 0
}

fn find_nul(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .iter()
        .position(|&b| b == 0)
        .map(|pos| from + pos)
}

/// Server-side handshake for one client connection.
#[derive(Debug)]
pub struct Handshake {
    state: SocksState,
    /// Accumulated request bytes
    buf: Vec<u8>,
    /// Position of the user id terminator once a 4a request was detected
    user_end: Option<usize>,
    max_request_len: usize,
    /// Payload that arrived behind the request
    early_data: Vec<u8>,
    /// Unsent reply bytes
    reply: Vec<u8>,
}

impl Handshake {
    /// Create a handshake that gives up after `max_request_len` request bytes.
    pub fn new(max_request_len: usize) -> Self {
        Self {
            state: SocksState::ClientHello,
            buf: Vec::with_capacity(MIN_REQUEST_LEN),
            user_end: None,
            max_request_len: max_request_len.max(MIN_REQUEST_LEN),
            early_data: Vec::new(),
            reply: Vec::new(),
        }
    }

    pub fn state(&self) -> SocksState {
        self.state
    }

    /// How many more request bytes may be read.
    pub fn read_budget(&self) -> usize {
        if self.state.is_negotiating() {
            self.max_request_len.saturating_sub(self.buf.len())
        } else {
            0
        }
    }

    /// Feed bytes read from the client.
    ///
    /// Returns `Ok(None)` while the request is incomplete. A protocol error
    /// moves the handshake to `ServerHelloClose` with a denied reply queued.
    pub fn receive(&mut self, data: &[u8]) -> Result<Option<Request>, ProtocolError> {
        if !self.state.is_negotiating() {
            return Ok(None);
        }

        self.buf.extend_from_slice(data);
        match self.parse() {
            Ok(parsed) => Ok(parsed),
            Err(err) => {
                self.reject();
                Err(err)
            }
        }
    }

    fn parse(&mut self) -> Result<Option<Request>, ProtocolError> {
        if let Some(&version) = self.buf.first() {
            if version != SOCKS4_VERSION {
                return Err(ProtocolError::UnsupportedVersion(version));
            }
        }

        if self.buf.len() < MIN_REQUEST_LEN {
            return Ok(None);
        }

        let user_end = match self.user_end {
            Some(end) => end,
            None => match find_nul(&self.buf, REQUEST_HEADER_LEN) {
                Some(end) => end,
                None => return self.incomplete(),
            },
        };

        let octets = [self.buf[4], self.buf[5], self.buf[6], self.buf[7]];
        let (destination, consumed) = if is_domain_sentinel(octets) {
            if self.user_end.is_none() {
                self.user_end = Some(user_end);
                self.state = SocksState::ClientHelloDomainName;
            }

            let Some(name_end) = find_nul(&self.buf, user_end + 1) else {
                return self.incomplete();
            };
            let name = &self.buf[user_end + 1..name_end];
            if name.is_empty() {
                return Err(ProtocolError::EmptyDomain);
            }
            let name = std::str::from_utf8(name).map_err(|_| ProtocolError::InvalidDomain)?;
            (Destination::Domain(name.to_string()), name_end + 1)
        } else {
            (Destination::Ip(Ipv4Addr::from(octets)), user_end + 1)
        };

        let request = Request {
            version: self.buf[0],
            command: Command::from(self.buf[1]),
            port: u16::from_be_bytes([self.buf[2], self.buf[3]]),
            destination,
            user_id: String::from_utf8_lossy(&self.buf[REQUEST_HEADER_LEN..user_end]).into_owned(),
        };

        if request.command != Command::Connect {
            return Err(ProtocolError::UnsupportedCommand(request.command.into()));
        }

        self.early_data = self.buf.split_off(consumed);
        self.buf.clear();
        self.state = SocksState::WaitConnect;
        Ok(Some(request))
    }

    fn incomplete(&self) -> Result<Option<Request>, ProtocolError> {
        if self.buf.len() >= self.max_request_len {
            Err(ProtocolError::RequestTooLong(self.max_request_len))
        } else {
            Ok(None)
        }
    }

    /// Payload received behind the request, handed out once.
    pub fn take_early_data(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.early_data)
    }

    /// Record the destination connect result and queue the reply.
    pub fn connect_outcome(&mut self, granted: bool) {
        if self.state != SocksState::WaitConnect {
            return;
        }

        if granted {
            self.queue_reply(Reply::Granted, SocksState::ServerHelloOpen);
        } else {
            self.queue_reply(Reply::Denied, SocksState::ServerHelloClose);
        }
    }

    /// Abort the handshake with a denied reply.
    pub fn reject(&mut self) {
        if matches!(self.state, SocksState::Relay | SocksState::Close) || self.state.is_replying() {
            return;
        }
        self.buf.clear();
        self.queue_reply(Reply::Denied, SocksState::ServerHelloClose);
    }

    fn queue_reply(&mut self, reply: Reply, next: SocksState) {
        self.reply.clear();
        self.reply.extend_from_slice(&reply.encode());
        self.state = next;
    }

    /// Reply bytes not yet accepted by the socket
    pub fn pending_reply(&self) -> &[u8] {
        &self.reply
    }

    /// Drop `n` sent reply bytes; a drained reply finishes the handshake.
    pub fn reply_sent(&mut self, n: usize) {
        let n = n.min(self.reply.len());
        self.reply.drain(..n);

        if self.reply.is_empty() {
            match self.state {
                SocksState::ServerHelloOpen => self.state = SocksState::Relay,
                SocksState::ServerHelloClose => self.state = SocksState::Close,
                _ => {}
            }
        }
    }

    /// Force the terminal state.
    pub fn close(&mut self) {
        self.state = SocksState::Close;
        self.reply.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socks4a_domain_phase() {
        let mut hs = Handshake::new(1024);

        let parsed = hs.receive(&[0x04, 0x01, 0x00, 0x50, 0x00, 0x00, 0x00, 0x01, 0x00]).unwrap();
        assert!(parsed.is_none());
        assert_eq!(hs.state(), SocksState::ClientHelloDomainName);

        let request = hs.receive(b"example.com\x00").unwrap().unwrap();
        assert_eq!(request.destination, Destination::Domain("example.com".into()));
        assert_eq!(request.port, 80);
        assert_eq!(request.command, Command::Connect);
        assert_eq!(request.user_id, "");
        assert_eq!(hs.state(), SocksState::WaitConnect);
    }

    #[test]
    fn test_plain_socks4_completes_immediately() {
        let mut hs = Handshake::new(1024);

        let request = hs
            .receive(&[0x04, 0x01, 0x1f, 0x90, 0x7f, 0x00, 0x00, 0x01, 0x61, 0x62, 0x00])
            .unwrap()
            .unwrap();

        assert_eq!(request.version, 4);
        assert_eq!(request.port, 8080);
        assert_eq!(request.destination.to_string(), "127.0.0.1");
        assert_eq!(request.user_id, "ab");
        assert_eq!(request.target(), "127.0.0.1:8080");
        assert_eq!(hs.state(), SocksState::WaitConnect);
    }

    #[test]
    fn test_byte_at_a_time() {
        let wire = Request {
            user_id: "alice".into(),
            ..Request::connect(Destination::Domain("example.org".into()), 443)
        }
        .encode();

        let mut hs = Handshake::new(1024);
        let mut result = None;
        for (i, byte) in wire.iter().enumerate() {
            result = hs.receive(std::slice::from_ref(byte)).unwrap();
            if i + 1 < wire.len() {
                assert!(result.is_none(), "completed early at byte {}", i);
            }
        }

        let request = result.unwrap();
        assert_eq!(request.user_id, "alice");
        assert_eq!(request.destination, Destination::Domain("example.org".into()));
        assert_eq!(request.port, 443);
    }

    #[test]
    fn test_domain_in_same_read_resolves_without_waiting() {
        let wire = Request::connect(Destination::Domain("a.example".into()), 22).encode();
        let mut hs = Handshake::new(1024);

        let request = hs.receive(&wire).unwrap().unwrap();
        assert_eq!(request.destination.to_string(), "a.example");
        assert_eq!(hs.state(), SocksState::WaitConnect);
    }

    #[test]
    fn test_early_data_is_kept() {
        let mut wire = Request::connect(Destination::Ip(Ipv4Addr::LOCALHOST), 80).encode();
        wire.extend_from_slice(b"GET / HTTP/1.0\r\n");

        let mut hs = Handshake::new(1024);
        assert!(hs.receive(&wire).unwrap().is_some());
        assert_eq!(hs.take_early_data(), b"GET / HTTP/1.0\r\n");
        assert!(hs.take_early_data().is_empty());
    }

    #[test]
    fn test_wrong_version_is_rejected_on_first_byte() {
        let mut hs = Handshake::new(1024);

        let err = hs.receive(&[0x05]).unwrap_err();
        assert_eq!(err, ProtocolError::UnsupportedVersion(5));
        assert_eq!(hs.state(), SocksState::ServerHelloClose);
        assert_eq!(hs.pending_reply(), &[0x00, 0x5b, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_bind_is_rejected() {
        let mut request = Request::connect(Destination::Ip(Ipv4Addr::new(10, 0, 0, 1)), 21);
        request.command = Command::Bind;

        let mut hs = Handshake::new(1024);
        let err = hs.receive(&request.encode()).unwrap_err();
        assert_eq!(err, ProtocolError::UnsupportedCommand(0x02));
        assert_eq!(hs.state(), SocksState::ServerHelloClose);
    }

    #[test]
    fn test_missing_terminator_hits_limit() {
        let mut hs = Handshake::new(16);
        hs.receive(&[0x04, 0x01, 0x00, 0x50, 0x0a, 0x00, 0x00, 0x01]).unwrap();
        assert_eq!(hs.read_budget(), 8);

        let err = hs.receive(b"userwith").unwrap_err();
        assert_eq!(err, ProtocolError::RequestTooLong(16));
        assert_eq!(hs.read_budget(), 0);
    }

    #[test]
    fn test_empty_domain_is_rejected() {
        let mut hs = Handshake::new(1024);
        let err = hs
            .receive(&[0x04, 0x01, 0x00, 0x50, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00])
            .unwrap_err();
        assert_eq!(err, ProtocolError::EmptyDomain);
    }

    #[test]
    fn test_non_utf8_domain_is_rejected() {
        let mut hs = Handshake::new(1024);
        let err = hs
            .receive(&[0x04, 0x01, 0x00, 0x50, 0x00, 0x00, 0x00, 0x01, 0x00, 0xff, 0xfe, 0x00])
            .unwrap_err();

        assert_eq!(err, ProtocolError::InvalidDomain);
        assert_eq!(hs.state(), SocksState::ServerHelloClose);
        assert_eq!(hs.pending_reply(), &Reply::Denied.encode()[..]);
    }

    #[test]
    fn test_partial_reply_send() {
        let mut hs = Handshake::new(1024);
        hs.receive(&Request::connect(Destination::Ip(Ipv4Addr::LOCALHOST), 80).encode())
            .unwrap();

        hs.connect_outcome(true);
        assert_eq!(hs.state(), SocksState::ServerHelloOpen);
        assert_eq!(hs.pending_reply(), &Reply::Granted.encode());

        hs.reply_sent(3);
        assert_eq!(hs.pending_reply().len(), 5);
        assert_eq!(hs.state(), SocksState::ServerHelloOpen);

        hs.reply_sent(5);
        assert_eq!(hs.state(), SocksState::Relay);
    }

    #[test]
    fn test_denied_reply_closes() {
        let mut hs = Handshake::new(1024);
        hs.receive(&Request::connect(Destination::Ip(Ipv4Addr::LOCALHOST), 80).encode())
            .unwrap();

        hs.connect_outcome(false);
        assert_eq!(hs.pending_reply(), &[0x00, 0x5b, 0, 0, 0, 0, 0, 0]);
        hs.reply_sent(REPLY_LEN);
        assert_eq!(hs.state(), SocksState::Close);
    }

    #[test]
    fn test_reject_after_relay_is_ignored() {
        let mut hs = Handshake::new(1024);
        hs.receive(&Request::connect(Destination::Ip(Ipv4Addr::LOCALHOST), 80).encode())
            .unwrap();
        hs.connect_outcome(true);
        hs.reply_sent(REPLY_LEN);

        hs.reject();
        assert_eq!(hs.state(), SocksState::Relay);
        assert!(hs.pending_reply().is_empty());
    }
}
