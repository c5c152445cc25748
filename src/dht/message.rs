use super::error::DhtError;
use super::node::{compact_peer, parse_compact_peer, Node, NodeId};
use crate::bencode::{decode_lenient, encode, Value};
use crate::constants::CLIENT_VERSION;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::net::SocketAddrV4;

pub type TransactionId = Bytes;

/// KRPC error codes (BEP-5).
pub const ERROR_GENERIC: i64 = 201;
pub const ERROR_SERVER: i64 = 202;
pub const ERROR_PROTOCOL: i64 = 203;
pub const ERROR_METHOD_UNKNOWN: i64 = 204;

/// The four query methods.
///
/// Replies carry no method name on the wire, so the RPC engine remembers
/// which kind each transaction asked and [`DhtResponse::classify`] labels
/// the reply with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
}

#[derive(Debug, Clone)]
pub enum DhtQuery {
    Ping,
    FindNode {
        target: NodeId,
    },
    GetPeers {
        info_hash: [u8; 20],
    },
    AnnouncePeer {
        info_hash: [u8; 20],
        port: u16,
        token: Bytes,
        implied_port: bool,
    },
    /// A well-formed query whose method we do not implement; answered
    /// with error 204.
    Unknown,
}

#[derive(Debug, Clone)]
pub enum DhtResponse {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        nodes: Vec<Node>,
    },
    GetPeers {
        id: NodeId,
        token: Bytes,
        peers: Option<Vec<SocketAddrV4>>,
        nodes: Option<Vec<Node>>,
    },
    AnnouncePeer {
        id: NodeId,
    },
    Error {
        code: i64,
        message: String,
    },
}

impl DhtResponse {
    /// The responder's ID, absent only on error replies.
    pub fn sender(&self) -> Option<NodeId> {
        match self {
            DhtResponse::Ping { id }
            | DhtResponse::FindNode { id, .. }
            | DhtResponse::GetPeers { id, .. }
            | DhtResponse::AnnouncePeer { id } => Some(*id),
            DhtResponse::Error { .. } => None,
        }
    }

    /// Re-labels this reply as an answer to a `kind` query.
    ///
    /// [`DhtMessage::parse`] can only guess a reply's variant from the
    /// fields present, and a bare `{id}` dict is a ping ack and an
    /// announce ack alike. The query kind recorded with the transaction
    /// settles it; fields the expected variant cannot carry are dropped,
    /// and error replies pass through unchanged.
    pub fn classify(self, kind: QueryKind) -> DhtResponse {
        let Some(id) = self.sender() else {
            return self;
        };

        match kind {
            QueryKind::Ping => DhtResponse::Ping { id },
            QueryKind::AnnouncePeer => DhtResponse::AnnouncePeer { id },
            QueryKind::FindNode => {
                let nodes = match self {
                    DhtResponse::FindNode { nodes, .. } => nodes,
                    DhtResponse::GetPeers { nodes, .. } => nodes.unwrap_or_default(),
                    _ => Vec::new(),
                };
                DhtResponse::FindNode { id, nodes }
            }
            QueryKind::GetPeers => match self {
                resp @ DhtResponse::GetPeers { .. } => resp,
                DhtResponse::FindNode { nodes, .. } => DhtResponse::GetPeers {
                    id,
                    token: Bytes::new(),
                    peers: None,
                    nodes: Some(nodes),
                },
                _ => DhtResponse::GetPeers {
                    id,
                    token: Bytes::new(),
                    peers: None,
                    nodes: None,
                },
            },
        }
    }
}

/// One KRPC message: a bencoded dictionary carrying either a query or a
/// response/error, correlated by an opaque transaction ID.
///
/// This type is the only place that knows the wire field names (`t`, `y`,
/// `v`, `q`, `a`, `r`, `e`, ...); everything above it works with the typed
/// variants.
#[derive(Debug, Clone)]
pub struct DhtMessage {
    pub transaction_id: TransactionId,
    pub sender_id: Option<NodeId>,
    pub version: Option<Bytes>,
    pub query: Option<(String, DhtQuery)>,
    pub response: Option<DhtResponse>,
}

impl DhtMessage {
    pub fn ping(transaction_id: TransactionId, our_id: &NodeId) -> Self {
        Self::query(transaction_id, *our_id, "ping", DhtQuery::Ping)
    }

    pub fn find_node(transaction_id: TransactionId, our_id: &NodeId, target: NodeId) -> Self {
        Self::query(
            transaction_id,
            *our_id,
            "find_node",
            DhtQuery::FindNode { target },
        )
    }

    pub fn get_peers(transaction_id: TransactionId, our_id: &NodeId, info_hash: [u8; 20]) -> Self {
        Self::query(
            transaction_id,
            *our_id,
            "get_peers",
            DhtQuery::GetPeers { info_hash },
        )
    }

    pub fn announce_peer(
        transaction_id: TransactionId,
        our_id: &NodeId,
        info_hash: [u8; 20],
        port: u16,
        token: Bytes,
        implied_port: bool,
    ) -> Self {
        Self::query(
            transaction_id,
            *our_id,
            "announce_peer",
            DhtQuery::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
            },
        )
    }

    /// A response to the query carrying `transaction_id`.
    pub fn response(transaction_id: TransactionId, response: DhtResponse) -> Self {
        Self {
            transaction_id,
            sender_id: None,
            version: Some(Bytes::from_static(&CLIENT_VERSION)),
            query: None,
            response: Some(response),
        }
    }

    pub fn error(transaction_id: TransactionId, code: i64, message: &str) -> Self {
        Self::response(
            transaction_id,
            DhtResponse::Error {
                code,
                message: message.to_string(),
            },
        )
    }

    fn query(transaction_id: TransactionId, our_id: NodeId, name: &str, query: DhtQuery) -> Self {
        Self {
            transaction_id,
            sender_id: Some(our_id),
            version: Some(Bytes::from_static(&CLIENT_VERSION)),
            query: Some((name.to_string(), query)),
            response: None,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, DhtError> {
        let value = decode_lenient(data)?;

        let dict = value
            .as_dict()
            .ok_or_else(|| DhtError::InvalidMessage("expected dict".into()))?;

        let transaction_id = dict
            .get(b"t".as_slice())
            .and_then(|v| v.as_bytes())
            .cloned()
            .ok_or_else(|| DhtError::InvalidMessage("missing transaction id".into()))?;

        let version = dict.get(b"v".as_slice()).and_then(|v| v.as_bytes()).cloned();

        let msg_type = dict
            .get(b"y".as_slice())
            .and_then(|v| v.as_str())
            .ok_or_else(|| DhtError::InvalidMessage("missing message type".into()))?;

        match msg_type {
            "q" => Self::parse_query(transaction_id, version, dict),
            "r" => Self::parse_response(transaction_id, version, dict),
            "e" => Self::parse_error(transaction_id, version, dict),
            _ => Err(DhtError::InvalidMessage(format!(
                "unknown message type: {}",
                msg_type
            ))),
        }
    }

    fn parse_query(
        transaction_id: TransactionId,
        version: Option<Bytes>,
        dict: &BTreeMap<Bytes, Value>,
    ) -> Result<Self, DhtError> {
        let query_name = dict
            .get(b"q".as_slice())
            .and_then(|v| v.as_str())
            .ok_or_else(|| DhtError::InvalidMessage("missing query name".into()))?;

        let args = dict
            .get(b"a".as_slice())
            .and_then(|v| v.as_dict())
            .ok_or_else(|| DhtError::InvalidMessage("missing query args".into()))?;

        let sender_id = args
            .get(b"id".as_slice())
            .and_then(|v| v.as_bytes())
            .and_then(|b| NodeId::from_bytes(b).ok());

        let query = match query_name {
            "ping" => DhtQuery::Ping,
            "find_node" => {
                let target = args
                    .get(b"target".as_slice())
                    .and_then(|v| v.as_bytes())
                    .and_then(|b| NodeId::from_bytes(b).ok())
                    .ok_or_else(|| DhtError::Protocol("missing target".into()))?;
                DhtQuery::FindNode { target }
            }
            "get_peers" => {
                let info_hash = parse_info_hash(args)?;
                DhtQuery::GetPeers { info_hash }
            }
            "announce_peer" => {
                let info_hash = parse_info_hash(args)?;

                let port = args
                    .get(b"port".as_slice())
                    .and_then(|v| v.as_integer())
                    .and_then(|p| u16::try_from(p).ok())
                    .ok_or_else(|| DhtError::Protocol("missing or invalid port".into()))?;

                let token = args
                    .get(b"token".as_slice())
                    .and_then(|v| v.as_bytes())
                    .cloned()
                    .ok_or_else(|| DhtError::Protocol("missing token".into()))?;

                let implied_port = args
                    .get(b"implied_port".as_slice())
                    .and_then(|v| v.as_integer())
                    .map(|v| v == 1)
                    .unwrap_or(false);

                DhtQuery::AnnouncePeer {
                    info_hash,
                    port,
                    token,
                    implied_port,
                }
            }
            _ => DhtQuery::Unknown,
        };

        Ok(Self {
            transaction_id,
            sender_id,
            version,
            query: Some((query_name.to_string(), query)),
            response: None,
        })
    }

    fn parse_response(
        transaction_id: TransactionId,
        version: Option<Bytes>,
        dict: &BTreeMap<Bytes, Value>,
    ) -> Result<Self, DhtError> {
        let resp = dict
            .get(b"r".as_slice())
            .and_then(|v| v.as_dict())
            .ok_or_else(|| DhtError::InvalidMessage("missing response dict".into()))?;

        let sender_id = resp
            .get(b"id".as_slice())
            .and_then(|v| v.as_bytes())
            .and_then(|b| NodeId::from_bytes(b).ok())
            .ok_or_else(|| DhtError::Protocol("missing id in response".into()))?;

        let nodes = resp
            .get(b"nodes".as_slice())
            .and_then(|v| v.as_bytes())
            .map(|data| {
                data.chunks_exact(26)
                    .filter_map(Node::from_compact)
                    .collect()
            });

        let peers = resp
            .get(b"values".as_slice())
            .and_then(|v| v.as_list())
            .map(|list| {
                list.iter()
                    .filter_map(|v| v.as_bytes())
                    .filter_map(|b| parse_compact_peer(b))
                    .collect()
            });

        let token = resp
            .get(b"token".as_slice())
            .and_then(|v| v.as_bytes())
            .cloned();

        // responses carry no query name; this labeling is provisional and
        // the RPC engine re-labels against the pending query via classify
        let response = if peers.is_some() || token.is_some() {
            DhtResponse::GetPeers {
                id: sender_id,
                token: token.unwrap_or_default(),
                peers,
                nodes,
            }
        } else if let Some(nodes) = nodes {
            DhtResponse::FindNode {
                id: sender_id,
                nodes,
            }
        } else {
            DhtResponse::Ping { id: sender_id }
        };

        Ok(Self {
            transaction_id,
            sender_id: Some(sender_id),
            version,
            query: None,
            response: Some(response),
        })
    }

    fn parse_error(
        transaction_id: TransactionId,
        version: Option<Bytes>,
        dict: &BTreeMap<Bytes, Value>,
    ) -> Result<Self, DhtError> {
        let error = dict
            .get(b"e".as_slice())
            .and_then(|v| v.as_list())
            .ok_or_else(|| DhtError::InvalidMessage("missing error list".into()))?;

        let code = error.first().and_then(|v| v.as_integer()).unwrap_or(0);

        let message = error
            .get(1)
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
            .to_string();

        Ok(Self {
            transaction_id,
            sender_id: None,
            version,
            query: None,
            response: Some(DhtResponse::Error { code, message }),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, DhtError> {
        let mut dict = BTreeMap::new();

        dict.insert(
            Bytes::from_static(b"t"),
            Value::Bytes(self.transaction_id.clone()),
        );

        if let Some(version) = &self.version {
            dict.insert(Bytes::from_static(b"v"), Value::Bytes(version.clone()));
        }

        if let Some((name, query)) = &self.query {
            dict.insert(Bytes::from_static(b"y"), Value::string("q"));
            dict.insert(Bytes::from_static(b"q"), Value::string(name));

            let mut args = BTreeMap::new();

            if let Some(id) = &self.sender_id {
                args.insert(
                    Bytes::from_static(b"id"),
                    Value::Bytes(Bytes::copy_from_slice(id.as_bytes())),
                );
            }

            match query {
                DhtQuery::Ping | DhtQuery::Unknown => {}
                DhtQuery::FindNode { target } => {
                    args.insert(
                        Bytes::from_static(b"target"),
                        Value::Bytes(Bytes::copy_from_slice(target.as_bytes())),
                    );
                }
                DhtQuery::GetPeers { info_hash } => {
                    args.insert(
                        Bytes::from_static(b"info_hash"),
                        Value::Bytes(Bytes::copy_from_slice(info_hash)),
                    );
                }
                DhtQuery::AnnouncePeer {
                    info_hash,
                    port,
                    token,
                    implied_port,
                } => {
                    args.insert(
                        Bytes::from_static(b"info_hash"),
                        Value::Bytes(Bytes::copy_from_slice(info_hash)),
                    );
                    args.insert(Bytes::from_static(b"port"), Value::integer(*port as i64));
                    args.insert(Bytes::from_static(b"token"), Value::Bytes(token.clone()));
                    if *implied_port {
                        args.insert(Bytes::from_static(b"implied_port"), Value::integer(1));
                    }
                }
            }

            dict.insert(Bytes::from_static(b"a"), Value::Dict(args));
        }

        if let Some(response) = &self.response {
            match response {
                DhtResponse::Error { code, message } => {
                    dict.insert(Bytes::from_static(b"y"), Value::string("e"));
                    dict.insert(
                        Bytes::from_static(b"e"),
                        Value::List(vec![Value::integer(*code), Value::string(message)]),
                    );
                }
                _ => {
                    dict.insert(Bytes::from_static(b"y"), Value::string("r"));

                    let mut resp = BTreeMap::new();

                    match response {
                        DhtResponse::Ping { id } | DhtResponse::AnnouncePeer { id } => {
                            resp.insert(
                                Bytes::from_static(b"id"),
                                Value::Bytes(Bytes::copy_from_slice(id.as_bytes())),
                            );
                        }
                        DhtResponse::FindNode { id, nodes } => {
                            resp.insert(
                                Bytes::from_static(b"id"),
                                Value::Bytes(Bytes::copy_from_slice(id.as_bytes())),
                            );
                            resp.insert(
                                Bytes::from_static(b"nodes"),
                                Value::Bytes(Bytes::from(compact_nodes(nodes))),
                            );
                        }
                        DhtResponse::GetPeers {
                            id,
                            token,
                            peers,
                            nodes,
                        } => {
                            resp.insert(
                                Bytes::from_static(b"id"),
                                Value::Bytes(Bytes::copy_from_slice(id.as_bytes())),
                            );
                            resp.insert(Bytes::from_static(b"token"), Value::Bytes(token.clone()));

                            // exactly one of values/nodes goes on the wire
                            match peers {
                                Some(peers) => {
                                    let values = peers
                                        .iter()
                                        .map(|addr| {
                                            Value::Bytes(Bytes::copy_from_slice(&compact_peer(
                                                addr,
                                            )))
                                        })
                                        .collect();
                                    resp.insert(
                                        Bytes::from_static(b"values"),
                                        Value::List(values),
                                    );
                                }
                                None => {
                                    let compact = nodes.as_deref().unwrap_or_default();
                                    resp.insert(
                                        Bytes::from_static(b"nodes"),
                                        Value::Bytes(Bytes::from(compact_nodes(compact))),
                                    );
                                }
                            }
                        }
                        DhtResponse::Error { .. } => {}
                    }

                    dict.insert(Bytes::from_static(b"r"), Value::Dict(resp));
                }
            }
        }

        encode(&Value::Dict(dict)).map_err(DhtError::from)
    }
}

fn parse_info_hash(args: &BTreeMap<Bytes, Value>) -> Result<[u8; 20], DhtError> {
    args.get(b"info_hash".as_slice())
        .and_then(|v| v.as_bytes())
        .filter(|b| b.len() == 20)
        .map(|b| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(b);
            hash
        })
        .ok_or_else(|| DhtError::Protocol("missing info_hash".into()))
}

fn compact_nodes(nodes: &[Node]) -> Vec<u8> {
    nodes.iter().flat_map(|n| n.to_compact()).collect()
}
