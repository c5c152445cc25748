//! Distributed Hash Table ([BEP-5]).
//!
//! This module implements the Kademlia-based DHT used by BitTorrent for
//! trackerless peer discovery. Nodes are identified by 160-bit IDs, torrents
//! by their 20-byte info hash, and proximity is the XOR distance metric.
//!
//! # Getting Started
//!
//! ```no_run
//! use rdht::dht::{DhtConfig, DhtServer};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Bind to a UDP port
//! let dht = Arc::new(DhtServer::bind(DhtConfig::with_port(6881)).await?);
//!
//! // The run loop owns the socket reads and timers
//! let server = dht.clone();
//! tokio::spawn(async move { server.run().await });
//!
//! // Bootstrap from known nodes
//! dht.bootstrap().await?;
//!
//! // Find peers for a torrent
//! let info_hash = [0u8; 20]; // Your torrent's info hash
//! let peers = dht.get_peers(info_hash).await?;
//!
//! for peer in peers {
//!     println!("Found peer: {}", peer);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # DHT Operations
//!
//! ## Queries
//!
//! - **ping** - Check if a node is alive
//! - **find_node** - Find nodes close to a target ID
//! - **get_peers** - Find peers for an info hash
//! - **announce_peer** - Announce that we have a torrent
//!
//! ## Bootstrap Nodes
//!
//! The DHT starts empty and needs to bootstrap from known nodes.
//! Default bootstrap nodes are provided:
//!
//! - `router.bittorrent.com:6881`
//! - `dht.transmissionbt.com:6881`
//! - `router.utorrent.com:6881`
//!
//! # Architecture
//!
//! - [`DhtServer`] - UDP event loop, query handling, and the public API
//! - [`RoutingTable`] - k-buckets partitioning the ID space
//! - [`TokenManager`] - rotating secrets behind announce tokens
//! - [`NodeId`] / [`Node`] - 160-bit identifier and contact record
//!
//! # Routing Table
//!
//! The table starts as a single bucket spanning the whole ID space. A full
//! bucket splits at its range midpoint while our own ID falls inside it;
//! other buckets keep a single replacement candidate instead. Nodes are
//! categorized as:
//!
//! - **Good** - Recently seen, no failures
//! - **Questionable** - Not seen for 15 minutes
//! - **Bad** - Two consecutive unanswered queries
//!
//! [BEP-5]: http://bittorrent.org/beps/bep_0005.html

mod bucket;
mod config;
mod error;
mod message;
mod node;
mod routing;
mod rpc;
mod server;
mod task;
mod token;

pub use config::DhtConfig;
pub use error::DhtError;
pub use message::{
    DhtMessage, DhtQuery, DhtResponse, QueryKind, TransactionId, ERROR_GENERIC,
    ERROR_METHOD_UNKNOWN, ERROR_PROTOCOL, ERROR_SERVER,
};
pub use node::{Node, NodeId};
pub use routing::{AddOutcome, DhtEvent, RoutingTable};
pub use server::DhtServer;
pub use token::TokenManager;

#[cfg(test)]
mod tests;
