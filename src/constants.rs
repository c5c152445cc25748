//! Protocol constants and tuning defaults.
//!
//! Default values follow BEP-5 and the conventions of mainstream DHT
//! implementations; the per-node knobs among them can be overridden through
//! [`DhtConfig`](crate::dht::DhtConfig).

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Version bytes sent in the `v` field of outgoing messages (BEP-20 style).
pub const CLIENT_VERSION: [u8; 4] = *b"RD\x00\x01";

/// Default DHT listen port.
pub const DEFAULT_PORT: u16 = 6881;

// ============================================================================
// Bootstrap
// ============================================================================

/// Well-known bootstrap routers.
pub const BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

/// Give up on bootstrap after this long even if the table never splits.
pub const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Routing table
// ============================================================================

/// Bucket capacity (the Kademlia `K`).
pub const BUCKET_SIZE: usize = 8;

/// Concurrent queries per lookup round (the Kademlia `α`).
pub const LOOKUP_ALPHA: usize = 3;

/// Total query budget of a single lookup, as a multiple of `K`.
pub const LOOKUP_QUERY_FACTOR: usize = 20;

/// Stop a get_peers lookup early once this many peers were collected.
pub const LOOKUP_PEER_CAP: usize = 50;

/// A node that has been silent this long becomes questionable.
pub const NODE_QUESTIONABLE_AFTER: Duration = Duration::from_secs(15 * 60);

/// Consecutive unanswered queries before a node is bad.
pub const MAX_NODE_FAILURES: u8 = 2;

/// Buckets idle this long are refreshed with a lookup in their range.
pub const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

// ============================================================================
// RPC
// ============================================================================

/// Per-request response deadline.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(15);

/// Ceiling on concurrently pending requests; sends beyond it fail fast.
pub const MAX_IN_FLIGHT: usize = 256;

/// How often overdue pending requests are swept.
pub const RPC_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Inbound datagrams above this size are discarded unparsed.
pub const MAX_DATAGRAM_SIZE: usize = 1500;

// ============================================================================
// Tokens and announced peers
// ============================================================================

/// Announce-token secret rotation period. Tokens stay valid for one
/// rotation past the epoch that issued them.
pub const TOKEN_ROTATION_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// How long an announced peer stays in the store.
pub const PEER_ANNOUNCE_LIFETIME: Duration = Duration::from_secs(30 * 60);

/// Cap on stored peers per infohash.
pub const MAX_PEERS_PER_TORRENT: usize = 1000;
