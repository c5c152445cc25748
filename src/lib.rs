//! rdht - A BitTorrent Mainline DHT library
//!
//! This library implements the Kademlia-based distributed hash table used
//! by BitTorrent for trackerless peer discovery, following BEP
//! (BitTorrent Enhancement Proposals) specifications.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 Bencode encoding/decoding
//! - [`dht`] - BEP-5 Distributed Hash Table node
//! - [`constants`] - Protocol constants and tuning defaults

pub mod bencode;
pub mod constants;
pub mod dht;

pub use bencode::{decode, decode_lenient, encode, BencodeError, Value};
pub use dht::{
    AddOutcome, DhtConfig, DhtError, DhtEvent, DhtMessage, DhtServer, Node, NodeId, RoutingTable,
    TokenManager,
};
