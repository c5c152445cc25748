use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::debug;

use super::error::DhtError;
use super::message::{DhtMessage, DhtResponse, QueryKind, TransactionId};
use super::node::NodeId;
use super::routing::RoutingTable;

struct PendingRequest {
    addr: SocketAddrV4,
    node_id: Option<NodeId>,
    kind: QueryKind,
    deadline: Instant,
    tx: oneshot::Sender<Result<DhtResponse, DhtError>>,
}

/// Correlates outbound queries with their replies.
///
/// Every in-flight query lives in a map keyed by its transaction ID until a
/// matching reply arrives, its deadline passes, or the send fails; exactly
/// one of those completes it. The engine reports outcomes to the routing
/// table by node ID only, never holding a `Node` itself.
pub(crate) struct RpcEngine {
    socket: Arc<UdpSocket>,
    table: Arc<RoutingTable>,
    pending: Mutex<HashMap<TransactionId, PendingRequest>>,
    rpc_timeout: Duration,
    max_in_flight: usize,
}

impl RpcEngine {
    pub fn new(
        socket: Arc<UdpSocket>,
        table: Arc<RoutingTable>,
        rpc_timeout: Duration,
        max_in_flight: usize,
    ) -> Self {
        Self {
            socket,
            table,
            pending: Mutex::new(HashMap::new()),
            rpc_timeout,
            max_in_flight,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Sends one query and awaits its reply.
    ///
    /// `make` receives the allocated transaction ID and builds the message;
    /// `kind` is recorded so the reply can be labeled as an answer to this
    /// query. Fails fast with [`DhtError::Busy`] at the in-flight ceiling.
    /// A remote error reply surfaces as [`DhtError::Protocol`]; an expired
    /// deadline as [`DhtError::Timeout`], which also counts against the
    /// target node.
    pub async fn call(
        &self,
        addr: SocketAddrV4,
        node_id: Option<NodeId>,
        kind: QueryKind,
        make: impl FnOnce(TransactionId) -> DhtMessage,
    ) -> Result<DhtResponse, DhtError> {
        let (tid, rx) = self.register(addr, node_id, kind)?;

        let data = match make(tid.clone()).encode() {
            Ok(data) => data,
            Err(e) => {
                self.pending.lock().remove(&tid);
                return Err(e);
            }
        };

        if let Err(e) = self.socket.send_to(&data, addr).await {
            self.pending.lock().remove(&tid);
            self.mark_failed(node_id);
            return Err(e.into());
        }

        // the periodic sweep normally fires first; this is the backstop for
        // callers running without the server loop
        match timeout(self.rpc_timeout + Duration::from_millis(100), rx).await {
            Ok(Ok(Ok(DhtResponse::Error { code, message }))) => {
                // an error reply is still an answer; the node is alive
                if let Some(id) = node_id {
                    self.table.mark_seen(&id);
                }
                Err(DhtError::Protocol(format!("remote error {}: {}", code, message)))
            }
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DhtError::Timeout),
            Err(_) => {
                if self.pending.lock().remove(&tid).is_some() {
                    self.mark_failed(node_id);
                }
                Err(DhtError::Timeout)
            }
        }
    }

    /// Delivers an inbound reply (`y` = `r` or `e`) to its pending request.
    ///
    /// Replies with an unknown transaction ID, or arriving from a different
    /// endpoint than the query went to, are dropped.
    pub fn handle_reply(&self, msg: DhtMessage, from: SocketAddrV4) {
        let Some(response) = msg.response else { return };

        let entry = {
            let mut pending = self.pending.lock();
            match pending.get(&msg.transaction_id) {
                Some(request) if request.addr == from => pending.remove(&msg.transaction_id),
                Some(_) => {
                    debug!("reply from {} does not match pending endpoint", from);
                    return;
                }
                None => {
                    debug!("unmatched reply from {}", from);
                    return;
                }
            }
        };

        if let Some(request) = entry {
            let _ = request.tx.send(Ok(response.classify(request.kind)));
        }
    }

    /// Completes every request whose deadline has passed with a timeout
    /// error and counts the miss against its node.
    pub fn sweep(&self, now: Instant) {
        let overdue: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            let expired: Vec<TransactionId> = pending
                .iter()
                .filter(|(_, req)| req.deadline <= now)
                .map(|(tid, _)| tid.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|tid| pending.remove(&tid))
                .collect()
        };

        for request in overdue {
            debug!("query to {} timed out", request.addr);
            self.mark_failed(request.node_id);
            let _ = request.tx.send(Err(DhtError::Timeout));
        }
    }

    fn register(
        &self,
        addr: SocketAddrV4,
        node_id: Option<NodeId>,
        kind: QueryKind,
    ) -> Result<
        (
            TransactionId,
            oneshot::Receiver<Result<DhtResponse, DhtError>>,
        ),
        DhtError,
    > {
        let mut pending = self.pending.lock();

        if pending.len() >= self.max_in_flight {
            return Err(DhtError::Busy);
        }

        let tid = loop {
            let raw: [u8; 2] = rand::random();
            let tid = Bytes::copy_from_slice(&raw);
            if !pending.contains_key(&tid) {
                break tid;
            }
        };

        let (tx, rx) = oneshot::channel();
        pending.insert(
            tid.clone(),
            PendingRequest {
                addr,
                node_id,
                kind,
                deadline: Instant::now() + self.rpc_timeout,
                tx,
            },
        );

        Ok((tid, rx))
    }

    fn mark_failed(&self, node_id: Option<NodeId>) {
        if let Some(id) = node_id {
            self.table.mark_failed(&id);
        }
    }
}
