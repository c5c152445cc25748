use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use super::node::NodeId;
use crate::constants::{
    BOOTSTRAP_NODES, BOOTSTRAP_TIMEOUT, BUCKET_SIZE, DEFAULT_PORT, LOOKUP_ALPHA, MAX_DATAGRAM_SIZE,
    MAX_IN_FLIGHT, RPC_TIMEOUT, TOKEN_ROTATION_INTERVAL,
};

/// Tuning knobs for a DHT node.
///
/// The defaults are the BEP-5 conventions; tests shrink the timing values.
///
/// # Examples
///
/// ```
/// use rdht::dht::DhtConfig;
///
/// let config = DhtConfig::with_port(6881);
/// assert_eq!(config.k, 8);
/// assert_eq!(config.alpha, 3);
/// ```
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Local UDP endpoint to bind.
    pub bind_addr: SocketAddrV4,
    /// Fixed node ID; `None` generates a random one.
    pub node_id: Option<NodeId>,
    /// Bootstrap contacts, as `host:port` strings.
    pub bootstrap_nodes: Vec<String>,
    /// Bucket capacity (K).
    pub k: usize,
    /// Lookup concurrency width (α).
    pub alpha: usize,
    /// Per-request response deadline.
    pub rpc_timeout: Duration,
    /// Announce-token secret rotation period.
    pub token_rotation: Duration,
    /// Ceiling on concurrently pending requests.
    pub max_in_flight: usize,
    /// Inbound datagrams above this size are discarded.
    pub max_datagram: usize,
    /// Hard cap on bootstrap duration.
    pub bootstrap_timeout: Duration,
}

impl DhtConfig {
    /// A default configuration listening on the given port on all interfaces.
    pub fn with_port(port: u16) -> Self {
        Self {
            bind_addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port),
            ..Self::default()
        }
    }
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_PORT),
            node_id: None,
            bootstrap_nodes: BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect(),
            k: BUCKET_SIZE,
            alpha: LOOKUP_ALPHA,
            rpc_timeout: RPC_TIMEOUT,
            token_rotation: TOKEN_ROTATION_INTERVAL,
            max_in_flight: MAX_IN_FLIGHT,
            max_datagram: MAX_DATAGRAM_SIZE,
            bootstrap_timeout: BOOTSTRAP_TIMEOUT,
        }
    }
}
