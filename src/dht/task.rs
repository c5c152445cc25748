use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use std::net::SocketAddrV4;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::DhtError;
use super::message::{DhtMessage, DhtResponse, QueryKind};
use super::node::{Node, NodeId};
use super::routing::{AddOutcome, RoutingTable};
use super::rpc::RpcEngine;
use crate::constants::{LOOKUP_PEER_CAP, LOOKUP_QUERY_FACTOR};

/// What a lookup asks the nodes it visits.
pub(crate) enum LookupKind {
    FindNode,
    GetPeers { info_hash: [u8; 20] },
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CandidateState {
    Fresh,
    InFlight,
    Succeeded,
    Failed,
}

struct Candidate {
    node: Node,
    state: CandidateState,
}

pub(crate) struct LookupOutcome {
    /// Responders that answered, ascending by distance to the target, at
    /// most K.
    pub closest: Vec<Node>,
    /// Responders that supplied an announce token, ascending by distance.
    pub tokens: Vec<(Node, Bytes)>,
    /// Peers reported for the target infohash.
    pub peers: Vec<SocketAddrV4>,
    /// Total queries issued.
    pub queries: usize,
}

/// One iterative lookup toward a target ID.
///
/// Keeps a distance-ordered candidate set seeded from the routing table and
/// works it with up to α queries in flight, merging each answer's contacts
/// back in. Terminates once the K closest live candidates have all
/// answered, the query budget is spent, the candidates run dry, or the
/// task is cancelled. Cancellation stops new queries and lets the
/// outstanding ones finish on their own.
pub(crate) struct Lookup {
    table: Arc<RoutingTable>,
    rpc: Arc<RpcEngine>,
    target: NodeId,
    kind: LookupKind,
    k: usize,
    alpha: usize,
    cancel: CancellationToken,
}

impl Lookup {
    pub fn new(
        table: Arc<RoutingTable>,
        rpc: Arc<RpcEngine>,
        target: NodeId,
        kind: LookupKind,
        k: usize,
        alpha: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            table,
            rpc,
            target,
            kind,
            k,
            alpha,
            cancel,
        }
    }

    /// Runs the lookup to completion.
    ///
    /// Peers found along the way stream into `peers_tx` as they arrive,
    /// in addition to being collected in the outcome.
    pub async fn run(&self, peers_tx: Option<&mpsc::Sender<SocketAddrV4>>) -> LookupOutcome {
        let mut candidates: BTreeMap<NodeId, Candidate> = BTreeMap::new();
        for node in self.table.get_closest(&self.target) {
            self.insert_candidate(&mut candidates, node);
        }

        let budget = self.k * LOOKUP_QUERY_FACTOR;
        let mut queries = 0;
        let mut peers: Vec<SocketAddrV4> = Vec::new();
        let mut in_flight = FuturesUnordered::new();

        loop {
            if !self.cancel.is_cancelled() {
                while in_flight.len() < self.alpha && queries < budget {
                    let Some(node) = next_fresh(&mut candidates) else {
                        break;
                    };
                    queries += 1;
                    in_flight.push(self.query(node));
                }
            }

            let Some((id, result)) = in_flight.next().await else {
                break;
            };

            match result {
                Ok(response) => {
                    set_state(&mut candidates, &self.target, &id, CandidateState::Succeeded);
                    self.absorb(response, &mut candidates, &mut peers, peers_tx)
                        .await;
                }
                Err(e) => {
                    debug!("lookup query failed: {}", e);
                    set_state(&mut candidates, &self.target, &id, CandidateState::Failed);
                }
            }

            if self.finished(&candidates) {
                break;
            }
            if matches!(self.kind, LookupKind::GetPeers { .. }) && peers.len() >= LOOKUP_PEER_CAP {
                break;
            }
        }

        let closest: Vec<Node> = candidates
            .values()
            .filter(|c| c.state == CandidateState::Succeeded)
            .take(self.k)
            .map(|c| c.node.clone())
            .collect();

        let tokens: Vec<(Node, Bytes)> = candidates
            .values()
            .filter(|c| c.state == CandidateState::Succeeded)
            .filter_map(|c| {
                let token = c.node.last_token.clone()?;
                Some((c.node.clone(), token))
            })
            .collect();

        LookupOutcome {
            closest,
            tokens,
            peers,
            queries,
        }
    }

    async fn query(&self, node: Node) -> (NodeId, Result<DhtResponse, DhtError>) {
        let our_id = self.table.our_id();
        let result = match &self.kind {
            LookupKind::FindNode => {
                self.rpc
                    .call(node.addr, Some(node.id), QueryKind::FindNode, |tid| {
                        DhtMessage::find_node(tid, our_id, self.target)
                    })
                    .await
            }
            LookupKind::GetPeers { info_hash } => {
                self.rpc
                    .call(node.addr, Some(node.id), QueryKind::GetPeers, |tid| {
                        DhtMessage::get_peers(tid, our_id, *info_hash)
                    })
                    .await
            }
        };
        (node.id, result)
    }

    async fn absorb(
        &self,
        response: DhtResponse,
        candidates: &mut BTreeMap<NodeId, Candidate>,
        peers: &mut Vec<SocketAddrV4>,
        peers_tx: Option<&mpsc::Sender<SocketAddrV4>>,
    ) {
        match response {
            DhtResponse::FindNode { nodes, .. } => {
                self.merge_contacts(candidates, nodes);
            }
            DhtResponse::GetPeers {
                id,
                token,
                peers: found,
                nodes,
            } => {
                if !token.is_empty() {
                    self.table.update_token(&id, token.clone());
                    if let Some(candidate) = candidates.get_mut(&id.distance(&self.target)) {
                        candidate.node.last_token = Some(token);
                    }
                }
                if let Some(nodes) = nodes {
                    self.merge_contacts(candidates, nodes);
                }
                if let Some(found) = found {
                    for peer in found {
                        if let Some(tx) = peers_tx {
                            let _ = tx.send(peer).await;
                        }
                        peers.push(peer);
                    }
                }
            }
            DhtResponse::Ping { .. }
            | DhtResponse::AnnouncePeer { .. }
            | DhtResponse::Error { .. } => {}
        }
    }

    fn merge_contacts(&self, candidates: &mut BTreeMap<NodeId, Candidate>, nodes: Vec<Node>) {
        for node in nodes {
            if node.id == *self.table.our_id() {
                continue;
            }
            offer_node(&self.table, &self.rpc, node.clone());
            self.insert_candidate(candidates, node);
        }
    }

    fn insert_candidate(&self, candidates: &mut BTreeMap<NodeId, Candidate>, node: Node) {
        let distance = node.id.distance(&self.target);
        candidates.entry(distance).or_insert(Candidate {
            node,
            state: CandidateState::Fresh,
        });

        // bound the candidate set; shed the farthest entries that are not
        // in flight
        let cap = 8 * self.k;
        while candidates.len() > cap {
            let Some(key) = candidates
                .iter()
                .rev()
                .find(|(_, c)| c.state != CandidateState::InFlight)
                .map(|(k, _)| *k)
            else {
                break;
            };
            candidates.remove(&key);
        }
    }

    /// The lookup is done when the K closest candidates that can still
    /// answer have all answered.
    fn finished(&self, candidates: &BTreeMap<NodeId, Candidate>) -> bool {
        let mut seen = 0;
        for candidate in candidates.values() {
            if candidate.state == CandidateState::Failed {
                continue;
            }
            if candidate.state != CandidateState::Succeeded {
                return false;
            }
            seen += 1;
            if seen == self.k {
                break;
            }
        }
        seen > 0
    }
}

fn next_fresh(candidates: &mut BTreeMap<NodeId, Candidate>) -> Option<Node> {
    let candidate = candidates
        .values_mut()
        .find(|c| c.state == CandidateState::Fresh)?;
    candidate.state = CandidateState::InFlight;
    Some(candidate.node.clone())
}

fn set_state(
    candidates: &mut BTreeMap<NodeId, Candidate>,
    target: &NodeId,
    id: &NodeId,
    state: CandidateState,
) {
    if let Some(candidate) = candidates.get_mut(&id.distance(target)) {
        candidate.state = state;
    }
}

/// Offers a contact to the routing table, kicking off a ping-to-evict
/// check when its bucket is full.
pub(crate) fn offer_node(table: &Arc<RoutingTable>, rpc: &Arc<RpcEngine>, node: Node) -> AddOutcome {
    let outcome = table.add(node);
    if let AddOutcome::Pending { to_ping } = &outcome {
        // failures > 0 means a check is already underway
        if to_ping.failures == 0 {
            spawn_evict_check(table.clone(), rpc.clone(), to_ping.clone());
        }
    }
    outcome
}

/// Pings a stale node to decide an eviction: two unanswered pings promote
/// the bucket's pending replacement, any answer keeps the node seated.
pub(crate) fn spawn_evict_check(table: Arc<RoutingTable>, rpc: Arc<RpcEngine>, stale: Node) {
    tokio::spawn(async move {
        for _ in 0..2 {
            let result = rpc
                .call(stale.addr, Some(stale.id), QueryKind::Ping, |tid| {
                    DhtMessage::ping(tid, table.our_id())
                })
                .await;

            if result.is_ok() {
                table.discard_replacement(&stale.id);
                return;
            }
        }

        debug!("evicting unresponsive node {}", stale.id);
        table.promote_replacement(&stale.id);
    });
}
