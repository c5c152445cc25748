use super::error::DhtError;
use crate::constants::{MAX_NODE_FAILURES, NODE_QUESTIONABLE_AFTER};
use bytes::Bytes;
use num_bigint::BigUint;
use rand::Rng as _;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant;

/// A 160-bit node identifier.
///
/// Node IDs are compared as unsigned big-endian integers; XOR of two IDs is
/// the Kademlia distance metric, and distances compare with the same order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    /// Generates a random node ID from a cryptographically secure source.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        rand::rng().fill(&mut id);
        Self(id)
    }

    /// Creates a node ID from a 20-byte slice.
    ///
    /// Infohashes are also 20 bytes, so this is how a lookup target is made
    /// from user input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        if bytes.len() != 20 {
            return Err(DhtError::InvalidNodeId);
        }
        let mut id = [0u8; 20];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// XOR distance to another ID.
    pub fn distance(&self, other: &NodeId) -> NodeId {
        let mut dist = [0u8; 20];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        NodeId(dist)
    }

    /// The ID as an unsigned big-endian integer.
    ///
    /// Bucket ranges span `[0, 2^160]` and midpoint sums carry into a 161st
    /// bit, so range arithmetic happens in `BigUint` rather than in the
    /// fixed-width ID itself.
    pub fn to_uint(&self) -> BigUint {
        BigUint::from_bytes_be(&self.0)
    }

    /// Creates a node ID from an unsigned integer, reduced modulo 2^160.
    pub fn from_uint(value: &BigUint) -> Self {
        let bytes = value.to_bytes_be();
        let mut id = [0u8; 20];
        if bytes.len() >= 20 {
            id.copy_from_slice(&bytes[bytes.len() - 20..]);
        } else {
            id[20 - bytes.len()..].copy_from_slice(&bytes);
        }
        Self(id)
    }
}

impl From<[u8; 20]> for NodeId {
    fn from(id: [u8; 20]) -> Self {
        Self(id)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// A known DHT contact.
///
/// The wire contact format is IPv4-only, so the address is a `SocketAddrV4`
/// throughout. A node is *questionable* after 15 minutes without traffic and
/// *bad* after two consecutive unanswered queries; bad nodes are the first
/// to be replaced when their bucket fills.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddrV4,
    pub last_seen: Instant,
    pub failures: u8,
    /// The announce token this node most recently sent us, if any.
    pub last_token: Option<Bytes>,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddrV4) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            failures: 0,
            last_token: None,
        }
    }

    /// Records a successful exchange: refreshes last-seen and clears the
    /// failure counter.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.failures = 0;
    }

    pub fn fail(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn is_questionable(&self) -> bool {
        self.last_seen.elapsed() >= NODE_QUESTIONABLE_AFTER
    }

    pub fn is_bad(&self) -> bool {
        self.failures >= MAX_NODE_FAILURES
    }

    pub fn is_good(&self) -> bool {
        self.failures == 0 && !self.is_questionable()
    }

    /// Parses a 26-byte compact contact (20-byte ID, 4-byte IPv4, 2-byte port).
    pub fn from_compact(data: &[u8]) -> Option<Self> {
        if data.len() != 26 {
            return None;
        }

        let id = NodeId::from_bytes(&data[..20]).ok()?;
        let ip = Ipv4Addr::new(data[20], data[21], data[22], data[23]);
        let port = u16::from_be_bytes([data[24], data[25]]);

        Some(Self::new(id, SocketAddrV4::new(ip, port)))
    }

    pub fn to_compact(&self) -> [u8; 26] {
        let mut compact = [0u8; 26];
        compact[..20].copy_from_slice(&self.id.0);
        compact[20..26].copy_from_slice(&compact_peer(&self.addr));
        compact
    }
}

/// Encodes a peer address as the 6-byte compact form (IPv4 + port).
pub fn compact_peer(addr: &SocketAddrV4) -> [u8; 6] {
    let mut data = [0u8; 6];
    data[..4].copy_from_slice(&addr.ip().octets());
    data[4..6].copy_from_slice(&addr.port().to_be_bytes());
    data
}

/// Parses a 6-byte compact peer address.
pub fn parse_compact_peer(data: &[u8]) -> Option<SocketAddrV4> {
    if data.len() != 6 {
        return None;
    }
    let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
    let port = u16::from_be_bytes([data[4], data[5]]);
    Some(SocketAddrV4::new(ip, port))
}
