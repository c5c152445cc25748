use super::config::DhtConfig;
use super::error::DhtError;
use super::message::{
    DhtMessage, DhtQuery, DhtResponse, QueryKind, ERROR_METHOD_UNKNOWN, ERROR_PROTOCOL,
};
use super::node::{Node, NodeId};
use super::routing::{DhtEvent, RoutingTable};
use super::rpc::RpcEngine;
use super::task::{offer_node, Lookup, LookupKind};
use super::token::TokenManager;
use crate::constants::{
    BUCKET_REFRESH_INTERVAL, MAX_PEERS_PER_TORRENT, PEER_ANNOUNCE_LIFETIME, RPC_SWEEP_INTERVAL,
};
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct AnnouncedPeer {
    addr: SocketAddrV4,
    announced_at: Instant,
}

struct PeerStore {
    peers: HashMap<[u8; 20], Vec<AnnouncedPeer>>,
}

impl PeerStore {
    fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    fn add_peer(&mut self, info_hash: [u8; 20], addr: SocketAddrV4) {
        let peers = self.peers.entry(info_hash).or_default();

        let now = Instant::now();
        peers.retain(|p| now.duration_since(p.announced_at) < PEER_ANNOUNCE_LIFETIME);
        peers.retain(|p| p.addr != addr);

        if peers.len() < MAX_PEERS_PER_TORRENT {
            peers.push(AnnouncedPeer {
                addr,
                announced_at: now,
            });
        }
    }

    fn get_peers(&mut self, info_hash: &[u8; 20]) -> Vec<SocketAddrV4> {
        let now = Instant::now();
        if let Some(peers) = self.peers.get_mut(info_hash) {
            peers.retain(|p| now.duration_since(p.announced_at) < PEER_ANNOUNCE_LIFETIME);
            peers.iter().map(|p| p.addr).collect()
        } else {
            Vec::new()
        }
    }
}

/// A Mainline DHT node.
///
/// `DhtServer` implements the BitTorrent DHT protocol ([BEP-5]) for finding
/// peers without relying on trackers.
///
/// # Examples
///
/// ```no_run
/// use rdht::dht::{DhtConfig, DhtServer};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// // Bind to a UDP port
/// let dht = Arc::new(DhtServer::bind(DhtConfig::with_port(6881)).await?);
///
/// // Drive the node in the background
/// let server = dht.clone();
/// tokio::spawn(async move { server.run().await });
///
/// // Bootstrap from known nodes
/// dht.bootstrap().await?;
///
/// // Find peers for a torrent
/// let info_hash = [0u8; 20];
/// let peers = dht.get_peers(info_hash).await?;
/// # Ok(())
/// # }
/// ```
///
/// [BEP-5]: http://bittorrent.org/beps/bep_0005.html
pub struct DhtServer {
    socket: Arc<UdpSocket>,
    our_id: NodeId,
    config: DhtConfig,
    routing_table: Arc<RoutingTable>,
    rpc: Arc<RpcEngine>,
    tokens: TokenManager,
    peer_store: Mutex<PeerStore>,
    cancel: CancellationToken,
    port: u16,
}

impl DhtServer {
    /// Binds the UDP socket and assembles the node.
    ///
    /// Bind failure is the only fatal error a node can meet; everything
    /// after this point degrades without tearing the node down.
    pub async fn bind(config: DhtConfig) -> Result<Self, DhtError> {
        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        let local_addr = socket.local_addr()?;
        let our_id = config.node_id.unwrap_or_else(NodeId::generate);

        info!("dht node bound to {} with id {}", local_addr, our_id);

        let routing_table = Arc::new(RoutingTable::new(our_id, config.k));
        let rpc = Arc::new(RpcEngine::new(
            socket.clone(),
            routing_table.clone(),
            config.rpc_timeout,
            config.max_in_flight,
        ));

        Ok(Self {
            socket,
            our_id,
            routing_table,
            rpc,
            tokens: TokenManager::new(),
            peer_store: Mutex::new(PeerStore::new()),
            cancel: CancellationToken::new(),
            port: local_addr.port(),
            config,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn our_id(&self) -> &NodeId {
        &self.our_id
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    /// Subscribes to routing-table notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<DhtEvent> {
        self.routing_table.subscribe()
    }

    /// Stops the event loop and cancels running lookups. Idempotent.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Populates the routing table from the configured bootstrap contacts.
    ///
    /// Pings the bootstrap routers, then looks our own ID up repeatedly
    /// until the table has grown past a single bucket or the configured
    /// time cap elapses.
    pub async fn bootstrap(&self) -> Result<(), DhtError> {
        info!("starting dht bootstrap");
        let deadline = Instant::now() + self.config.bootstrap_timeout;

        for addr_str in &self.config.bootstrap_nodes {
            match tokio::net::lookup_host(addr_str.as_str()).await {
                Ok(addrs) => {
                    let Some(addr) = addrs.filter_map(|a| match a {
                        SocketAddr::V4(v4) => Some(v4),
                        SocketAddr::V6(_) => None,
                    })
                    .next() else {
                        continue;
                    };
                    debug!("pinging bootstrap node {}", addr);
                    if let Err(e) = self.ping(addr).await {
                        debug!("bootstrap node {} did not answer: {}", addr, e);
                    }
                }
                Err(e) => {
                    warn!("failed to resolve bootstrap node {}: {}", addr_str, e);
                }
            }
        }

        while Instant::now() < deadline && !self.cancel.is_cancelled() {
            let lookup = self.lookup(self.our_id, LookupKind::FindNode);
            lookup.run(None).await;

            if self.routing_table.bucket_count() > 1 {
                info!(
                    "dht bootstrap complete, {} nodes in routing table",
                    self.routing_table.count_nodes()
                );
                return Ok(());
            }

            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        warn!(
            "dht bootstrap ended with a single bucket ({} nodes)",
            self.routing_table.count_nodes()
        );
        Ok(())
    }

    /// Pings a single node directly.
    pub async fn ping(&self, addr: SocketAddrV4) -> Result<DhtResponse, DhtError> {
        self.rpc
            .call(addr, None, QueryKind::Ping, |tid| {
                DhtMessage::ping(tid, &self.our_id)
            })
            .await
    }

    /// Iterative lookup of the nodes closest to `target`.
    pub async fn find_node(&self, target: NodeId) -> Result<Vec<Node>, DhtError> {
        let outcome = self.lookup(target, LookupKind::FindNode).run(None).await;
        Ok(outcome.closest)
    }

    /// Iterative lookup of peers for an infohash.
    pub async fn get_peers(&self, info_hash: [u8; 20]) -> Result<Vec<SocketAddrV4>, DhtError> {
        let target = NodeId::from(info_hash);
        let outcome = self
            .lookup(target, LookupKind::GetPeers { info_hash })
            .run(None)
            .await;

        info!(
            "dht get_peers found {} peers after {} queries",
            outcome.peers.len(),
            outcome.queries
        );
        Ok(outcome.peers)
    }

    /// Like [`get_peers`](Self::get_peers), but streams each peer into
    /// `peers_tx` as it is discovered.
    pub async fn get_peers_into(
        &self,
        info_hash: [u8; 20],
        peers_tx: mpsc::Sender<SocketAddrV4>,
    ) -> Result<Vec<SocketAddrV4>, DhtError> {
        let target = NodeId::from(info_hash);
        let outcome = self
            .lookup(target, LookupKind::GetPeers { info_hash })
            .run(Some(&peers_tx))
            .await;
        Ok(outcome.peers)
    }

    /// Announces ourselves as a peer for `info_hash`.
    ///
    /// Runs a get_peers lookup, then sends `announce_peer` to the closest
    /// responders that issued a token, in parallel. `port` is the port
    /// peers should connect to; `None` asks remotes to use our source UDP
    /// port instead (`implied_port`). Returns how many nodes accepted.
    pub async fn announce(
        &self,
        info_hash: [u8; 20],
        port: Option<u16>,
    ) -> Result<usize, DhtError> {
        let target = NodeId::from(info_hash);
        let outcome = self
            .lookup(target, LookupKind::GetPeers { info_hash })
            .run(None)
            .await;

        if outcome.tokens.is_empty() {
            return Err(DhtError::TokenInvalid);
        }

        let announces = outcome
            .tokens
            .into_iter()
            .take(self.config.k)
            .map(|(node, token)| self.announce_to(node, info_hash, port, token));

        let accepted = join_all(announces)
            .await
            .into_iter()
            .filter(|r| r.is_ok())
            .count();

        info!(
            "announced {:02x?}.. to {} nodes",
            &info_hash[..4],
            accepted
        );
        Ok(accepted)
    }

    /// Persists the routing table as a bencoded snapshot.
    pub fn save_routing_table(&self) -> Result<Vec<u8>, DhtError> {
        self.routing_table.save()
    }

    /// Restores a snapshot made by [`save_routing_table`](Self::save_routing_table).
    ///
    /// Contacts are inserted without emitting `NodeAdded` notifications.
    pub fn load_routing_table(&self, data: &[u8]) -> Result<usize, DhtError> {
        self.routing_table.load(data)
    }

    /// Drives the node: receives datagrams, sweeps RPC deadlines, rotates
    /// token secrets, and refreshes stale buckets. Runs until
    /// [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), DhtError> {
        let mut buf = vec![0u8; 65535];
        let mut sweep_interval = tokio::time::interval(RPC_SWEEP_INTERVAL);
        let mut refresh_interval = tokio::time::interval(BUCKET_REFRESH_INTERVAL);
        let mut token_rotation_interval = tokio::time::interval(self.config.token_rotation);

        sweep_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        refresh_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        token_rotation_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        refresh_interval.tick().await;
        token_rotation_interval.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Ok(());
                }
                result = self.socket.recv_from(&mut buf) => {
                    let (n, addr) = result?;
                    self.handle_datagram(&buf[..n], addr).await;
                }
                _ = sweep_interval.tick() => {
                    self.rpc.sweep(Instant::now());
                }
                _ = refresh_interval.tick() => {
                    self.refresh_stale_buckets();
                }
                _ = token_rotation_interval.tick() => {
                    self.tokens.rotate();
                }
            }
        }
    }

    fn lookup(&self, target: NodeId, kind: LookupKind) -> Lookup {
        Lookup::new(
            self.routing_table.clone(),
            self.rpc.clone(),
            target,
            kind,
            self.config.k,
            self.config.alpha,
            self.cancel.child_token(),
        )
    }

    async fn announce_to(
        &self,
        node: Node,
        info_hash: [u8; 20],
        port: Option<u16>,
        token: Bytes,
    ) -> Result<DhtResponse, DhtError> {
        self.rpc
            .call(node.addr, Some(node.id), QueryKind::AnnouncePeer, |tid| {
                DhtMessage::announce_peer(
                    tid,
                    &self.our_id,
                    info_hash,
                    port.unwrap_or(self.port),
                    token,
                    port.is_none(),
                )
            })
            .await
    }

    fn refresh_stale_buckets(&self) {
        for target in self.routing_table.refresh_targets() {
            debug!("refreshing stale bucket around {}", target);
            let lookup = self.lookup(target, LookupKind::FindNode);
            tokio::spawn(async move {
                lookup.run(None).await;
            });
        }
    }

    async fn handle_datagram(&self, data: &[u8], addr: SocketAddr) {
        let SocketAddr::V4(addr) = addr else {
            return;
        };

        if data.len() > self.config.max_datagram {
            debug!("discarding oversized datagram ({} bytes) from {}", data.len(), addr);
            return;
        }

        match DhtMessage::parse(data) {
            Ok(msg) => self.handle_message(msg, addr).await,
            Err(e) => {
                debug!("failed to parse message from {}: {}", addr, e);
            }
        }
    }

    async fn handle_message(&self, msg: DhtMessage, addr: SocketAddrV4) {
        if let Some(id) = msg.sender_id {
            offer_node(&self.routing_table, &self.rpc, Node::new(id, addr));
        }

        if msg.response.is_some() {
            self.rpc.handle_reply(msg, addr);
            return;
        }

        if let Some((_, ref query)) = msg.query {
            let response = self.handle_query(msg.transaction_id.clone(), addr, query);
            if let Ok(data) = response.encode() {
                let _ = self.socket.send_to(&data, addr).await;
            }
        }
    }

    fn handle_query(&self, tid: Bytes, addr: SocketAddrV4, query: &DhtQuery) -> DhtMessage {
        match query {
            DhtQuery::Ping => {
                DhtMessage::response(tid, DhtResponse::Ping { id: self.our_id })
            }
            DhtQuery::FindNode { target } => {
                let nodes = self.routing_table.get_closest(target);
                DhtMessage::response(
                    tid,
                    DhtResponse::FindNode {
                        id: self.our_id,
                        nodes,
                    },
                )
            }
            DhtQuery::GetPeers { info_hash } => {
                let token = self.tokens.generate(&addr);
                let stored = self.peer_store.lock().get_peers(info_hash);

                let (peers, nodes) = if stored.is_empty() {
                    let target = NodeId::from(*info_hash);
                    (None, Some(self.routing_table.get_closest(&target)))
                } else {
                    (Some(stored), None)
                };

                DhtMessage::response(
                    tid,
                    DhtResponse::GetPeers {
                        id: self.our_id,
                        token,
                        peers,
                        nodes,
                    },
                )
            }
            DhtQuery::AnnouncePeer {
                info_hash,
                port,
                implied_port,
                token,
            } => {
                if !self.tokens.verify(&addr, token) {
                    debug!("rejecting announce_peer from {}: invalid token", addr);
                    return DhtMessage::error(tid, ERROR_PROTOCOL, "Invalid token");
                }

                let peer_port = if *implied_port { addr.port() } else { *port };
                let peer_addr = SocketAddrV4::new(*addr.ip(), peer_port);
                self.peer_store.lock().add_peer(*info_hash, peer_addr);
                debug!(
                    "stored announced peer {} for info_hash {:02x?}..",
                    peer_addr,
                    &info_hash[..4]
                );

                DhtMessage::response(tid, DhtResponse::AnnouncePeer { id: self.our_id })
            }
            DhtQuery::Unknown => DhtMessage::error(tid, ERROR_METHOD_UNKNOWN, "Method Unknown"),
        }
    }
}
