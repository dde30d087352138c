//! Node Chain
//!
//! A connection's byte path is a line of nodes:
//!
//! ```text
//!  client ◀──▶ Source ◀──▶ Middle ◀──▶ ... ◀──▶ Middle ◀──▶ Sink ◀──▶ destination
//!              [in]        [in|out]             [in|out]    [out]
//! ```
//!
//! Each node owns the buffers of data travelling *into* it: the Source holds
//! what is headed for the client, the Sink holds what is headed for the
//! destination, and a Middle holds one buffer per direction. Neighbors are
//! addressed by [`NodeId`] inside the owning [`Chain`]; nodes never hold each
//! other.
//!
//! Middle nodes apply a [`Transform`] to bytes as they accept them. With no
//! Middle nodes the chain degenerates to a plain two-socket relay.

use crate::config::MiddleKind;
use crate::ring::RingBuffer;
use std::fmt;

/// Index of a node inside its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Direction of travel along the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client toward destination
    Downstream,
    /// Destination toward client
    Upstream,
}

/// In-place byte transform plugged into a Middle node.
///
/// Implementations must keep the length unchanged and must not block.
/// Bytes reach a transform exactly once, in stream order, and only when the
/// node has room to store them.
pub trait Transform: Send {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Client-to-destination bytes
    fn downstream(&mut self, _data: &mut [u8]) {}

    /// Destination-to-client bytes
    fn upstream(&mut self, _data: &mut [u8]) {}
}

/// Forwards bytes unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl Transform for PassThrough {
    fn name(&self) -> &'static str {
        "passthrough"
    }
}

/// ASCII-uppercases everything the client sends.
#[derive(Debug, Default, Clone, Copy)]
pub struct Uppercase;

impl Transform for Uppercase {
    fn name(&self) -> &'static str {
        "uppercase"
    }

    fn downstream(&mut self, data: &mut [u8]) {
        data.make_ascii_uppercase();
    }
}

impl MiddleKind {
    /// Instantiate the transform this kind names.
    pub fn build(&self) -> Box<dyn Transform> {
        match self {
            MiddleKind::PassThrough => Box::new(PassThrough),
            MiddleKind::Uppercase => Box::new(Uppercase),
        }
    }
}

/// Chain head, faces the client
#[derive(Debug)]
pub struct SourceNode {
    /// Bytes headed for the client
    inbound: RingBuffer,
}

/// Interposed stage
pub struct MiddleNode {
    /// Bytes headed for the client
    inbound: RingBuffer,
    /// Bytes headed for the destination
    outbound: RingBuffer,
    transform: Box<dyn Transform>,
}

impl fmt::Debug for MiddleNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddleNode")
            .field("transform", &self.transform.name())
            .field("inbound", &self.inbound.avail_read())
            .field("outbound", &self.outbound.avail_read())
            .finish()
    }
}

/// Chain tail, faces the destination
#[derive(Debug)]
pub struct SinkNode {
    /// Bytes headed for the destination
    outbound: RingBuffer,
}

/// One stage of the chain
#[derive(Debug)]
pub enum Node {
    Source(SourceNode),
    Middle(MiddleNode),
    Sink(SinkNode),
}

impl Node {
    /// Buffer that receives data travelling in `dir`, if this node has one.
    fn ingress(&self, dir: Direction) -> Option<&RingBuffer> {
        match (self, dir) {
            (Node::Source(n), Direction::Upstream) => Some(&n.inbound),
            (Node::Middle(n), Direction::Upstream) => Some(&n.inbound),
            (Node::Middle(n), Direction::Downstream) => Some(&n.outbound),
            (Node::Sink(n), Direction::Downstream) => Some(&n.outbound),
            _ => None,
        }
    }

    fn ingress_mut(&mut self, dir: Direction) -> Option<&mut RingBuffer> {
        match (self, dir) {
            (Node::Source(n), Direction::Upstream) => Some(&mut n.inbound),
            (Node::Middle(n), Direction::Upstream) => Some(&mut n.inbound),
            (Node::Middle(n), Direction::Downstream) => Some(&mut n.outbound),
            (Node::Sink(n), Direction::Downstream) => Some(&mut n.outbound),
            _ => None,
        }
    }

    /// Free space for data travelling in `dir`.
    pub fn space(&self, dir: Direction) -> usize {
        self.ingress(dir).map_or(0, RingBuffer::avail_write)
    }

    /// Buffered data travelling in `dir`.
    pub fn pending(&self, dir: Direction) -> usize {
        self.ingress(dir).map_or(0, RingBuffer::avail_read)
    }

    /// Store as much of `data` as fits, transforming it first on a Middle.
    ///
    /// Only the accepted prefix is transformed; the return value is the
    /// number of bytes the caller may consider delivered.
    pub fn accept(&mut self, dir: Direction, data: &mut [u8]) -> usize {
        let n = data.len().min(self.space(dir));
        if n == 0 {
            return 0;
        }

        if let Node::Middle(middle) = self {
            match dir {
                Direction::Downstream => middle.transform.downstream(&mut data[..n]),
                Direction::Upstream => middle.transform.upstream(&mut data[..n]),
            }
        }

        self.ingress_mut(dir).map_or(0, |ring| ring.write(&data[..n]))
    }
}

/// The nodes of one connection, Source first and Sink last.
#[derive(Debug)]
pub struct Chain {
    nodes: Vec<Node>,
    /// Staging area for Middle-to-neighbor transfers
    scratch: Vec<u8>,
}

impl Chain {
    /// Build `Source, transforms..., Sink` with every buffer sized `capacity`.
    pub fn new(capacity: usize, block_size: usize, transforms: Vec<Box<dyn Transform>>) -> Self {
        let mut nodes = Vec::with_capacity(transforms.len() + 2);
        nodes.push(Node::Source(SourceNode {
            inbound: RingBuffer::with_capacity(capacity),
        }));
        for transform in transforms {
            nodes.push(Node::Middle(MiddleNode {
                inbound: RingBuffer::with_capacity(capacity),
                outbound: RingBuffer::with_capacity(capacity),
                transform,
            }));
        }
        nodes.push(Node::Sink(SinkNode {
            outbound: RingBuffer::with_capacity(capacity),
        }));

        Self {
            nodes,
            scratch: vec![0u8; block_size.max(1)],
        }
    }

    /// Two-node chain with no transforms
    pub fn direct(capacity: usize, block_size: usize) -> Self {
        Self::new(capacity, block_size, Vec::new())
    }

    pub fn source(&self) -> NodeId {
        NodeId(0)
    }

    pub fn sink(&self) -> NodeId {
        NodeId(self.nodes.len() - 1)
    }

    pub fn middle_count(&self) -> usize {
        self.nodes.len() - 2
    }

    /// Transform names in chain order
    pub fn transform_names(&self) -> Vec<&'static str> {
        self.nodes
            .iter()
            .filter_map(|node| match node {
                Node::Middle(m) => Some(m.transform.name()),
                _ => None,
            })
            .collect()
    }

    fn neighbor(&self, from: NodeId, dir: Direction) -> Option<usize> {
        match dir {
            Direction::Downstream if from.0 + 1 < self.nodes.len() => Some(from.0 + 1),
            Direction::Upstream if from.0 > 0 => Some(from.0 - 1),
            _ => None,
        }
    }

    /// Room the downstream neighbor of `from` has for new data.
    pub fn avail_down(&self, from: NodeId) -> usize {
        self.neighbor(from, Direction::Downstream)
            .map_or(0, |i| self.nodes[i].space(Direction::Downstream))
    }

    /// Room the upstream neighbor of `from` has for new data.
    pub fn avail_up(&self, from: NodeId) -> usize {
        self.neighbor(from, Direction::Upstream)
            .map_or(0, |i| self.nodes[i].space(Direction::Upstream))
    }

    /// Hand `data` to the downstream neighbor of `from`; returns bytes taken.
    pub fn forward_down(&mut self, from: NodeId, data: &mut [u8]) -> usize {
        match self.neighbor(from, Direction::Downstream) {
            Some(i) => self.nodes[i].accept(Direction::Downstream, data),
            None => 0,
        }
    }

    /// Hand `data` to the upstream neighbor of `from`; returns bytes taken.
    pub fn forward_up(&mut self, from: NodeId, data: &mut [u8]) -> usize {
        match self.neighbor(from, Direction::Upstream) {
            Some(i) => self.nodes[i].accept(Direction::Upstream, data),
            None => 0,
        }
    }

    /// Buffer an endpoint's socket drains: Source inbound or Sink outbound.
    pub fn egress(&self, node: NodeId) -> &RingBuffer {
        match &self.nodes[node.0] {
            Node::Source(n) => &n.inbound,
            Node::Middle(n) => &n.inbound,
            Node::Sink(n) => &n.outbound,
        }
    }

    pub fn egress_mut(&mut self, node: NodeId) -> &mut RingBuffer {
        match &mut self.nodes[node.0] {
            Node::Source(n) => &mut n.inbound,
            Node::Middle(n) => &mut n.inbound,
            Node::Sink(n) => &mut n.outbound,
        }
    }

    /// Move buffered bytes out of Middle nodes toward both ends.
    ///
    /// Repeats until nothing moves; returns the total number of bytes moved.
    pub fn pump(&mut self) -> usize {
        let mut total = 0;
        loop {
            let mut moved = 0;
            for i in 1..self.nodes.len() - 1 {
                moved += self.transfer(i, i + 1, Direction::Downstream);
            }
            for i in (1..self.nodes.len() - 1).rev() {
                moved += self.transfer(i, i - 1, Direction::Upstream);
            }
            if moved == 0 {
                return total;
            }
            total += moved;
        }
    }

    fn transfer(&mut self, from: usize, to: usize, dir: Direction) -> usize {
        let Self { nodes, scratch } = self;

        let limit = scratch.len().min(nodes[to].space(dir));
        let Some(src) = nodes[from].ingress(dir) else {
            return 0;
        };
        let n = src.peek(&mut scratch[..limit]);
        if n == 0 {
            return 0;
        }

        let accepted = nodes[to].accept(dir, &mut scratch[..n]);
        if let Some(src) = nodes[from].ingress_mut(dir) {
            src.consume(accepted);
        }
        accepted
    }

    /// True when no bytes travelling in `dir` are buffered anywhere.
    pub fn is_drained(&self, dir: Direction) -> bool {
        self.nodes.iter().all(|node| node.pending(dir) == 0)
    }

    /// Drop everything travelling in `dir`.
    pub fn discard(&mut self, dir: Direction) {
        for node in &mut self.nodes {
            if let Some(ring) = node.ingress_mut(dir) {
                ring.clear();
            }
        }
    }
}
