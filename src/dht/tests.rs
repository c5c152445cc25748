use super::bucket::{Bucket, BucketAdd};
use super::message::ERROR_METHOD_UNKNOWN;
use super::rpc::RpcEngine;
use super::task::spawn_evict_check;
use super::*;
use bytes::Bytes;
use num_bigint::BigUint;
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

fn addr(host: [u8; 4], port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::from(host), port)
}

fn local(port: u16) -> SocketAddrV4 {
    addr([127, 0, 0, 1], port)
}

/// An ID that is all zeros except the last byte.
fn low_id(last: u8) -> NodeId {
    let mut id = [0u8; 20];
    id[19] = last;
    NodeId(id)
}

/// An ID in the upper half of the space.
fn high_id(second: u8) -> NodeId {
    let mut id = [0u8; 20];
    id[0] = 0x80;
    id[1] = second;
    NodeId(id)
}

fn test_config() -> DhtConfig {
    DhtConfig {
        bind_addr: local(0),
        bootstrap_nodes: Vec::new(),
        rpc_timeout: Duration::from_millis(500),
        bootstrap_timeout: Duration::from_millis(500),
        ..DhtConfig::default()
    }
}

async fn spawn_server(config: DhtConfig) -> Arc<DhtServer> {
    let server = Arc::new(DhtServer::bind(config).await.unwrap());
    let runner = server.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });
    server
}

// ============================================================================
// NodeId
// ============================================================================

#[test]
fn test_node_id_generate() {
    let id1 = NodeId::generate();
    let id2 = NodeId::generate();
    assert_ne!(id1.0, id2.0);
}

#[test]
fn test_node_id_from_bytes() {
    let bytes = [1u8; 20];
    let id = NodeId::from_bytes(&bytes).unwrap();
    assert_eq!(id.0, bytes);

    assert!(NodeId::from_bytes(&[1u8; 10]).is_err());
}

#[test]
fn test_node_id_distance() {
    let id1 = NodeId([0u8; 20]);
    let id2 = NodeId([0xFF; 20]);

    assert_eq!(id1.distance(&id2), NodeId([0xFF; 20]));
    assert_eq!(id1.distance(&id1), NodeId([0u8; 20]));
}

#[test]
fn test_node_id_ordering() {
    // big-endian unsigned comparison
    assert!(low_id(1) < low_id(2));
    assert!(low_id(0xFF) < high_id(0));
    assert!(high_id(0) < NodeId([0xFF; 20]));
}

#[test]
fn test_node_id_uint_roundtrip() {
    let id = NodeId::generate();
    assert_eq!(NodeId::from_uint(&id.to_uint()), id);

    // values are reduced modulo 2^160
    let wrapped = id.to_uint() + (BigUint::from(1u8) << 160);
    assert_eq!(NodeId::from_uint(&wrapped), id);
}

#[test]
fn test_midpoint_carry_survives() {
    // (max + max) >> 1 needs the 161st bit; a midpoint computed in BigUint
    // must land back at max, not at half of it
    let max = NodeId([0xFF; 20]).to_uint();
    let mid: BigUint = (&max + &max) >> 1;
    assert_eq!(mid, max);
}

// ============================================================================
// Node
// ============================================================================

#[test]
fn test_node_compact_roundtrip() {
    let id = NodeId([1u8; 20]);
    let node = Node::new(id, local(6881));

    let compact = node.to_compact();
    assert_eq!(compact.len(), 26);

    let parsed = Node::from_compact(&compact).unwrap();
    assert_eq!(parsed.id, id);
    assert_eq!(parsed.addr, node.addr);

    assert!(Node::from_compact(&compact[..20]).is_none());
}

#[test]
fn test_node_state() {
    let mut node = Node::new(NodeId::generate(), local(6881));

    assert!(node.is_good());
    assert!(!node.is_bad());

    node.fail();
    assert!(!node.is_bad());
    node.fail();
    assert!(node.is_bad());

    node.touch();
    assert!(node.is_good());
}

// ============================================================================
// Bucket
// ============================================================================

fn full_range_bucket(k: usize) -> Bucket {
    Bucket::new(BigUint::from(0u8), BigUint::from(1u8) << 160, k)
}

#[test]
fn test_bucket_add_outcomes() {
    let mut bucket = full_range_bucket(2);

    let a = Node::new(low_id(1), local(1));
    let b = Node::new(low_id(2), local(2));
    let c = Node::new(low_id(3), local(3));

    assert_eq!(bucket.add(a.clone()), BucketAdd::Added);
    assert_eq!(bucket.add(b), BucketAdd::Added);
    assert_eq!(bucket.add(a.clone()), BucketAdd::Updated);
    assert_eq!(bucket.nodes().len(), 2);

    // full of live nodes: stashed as replacement
    assert_eq!(bucket.add(c.clone()), BucketAdd::Full);
    assert_eq!(bucket.replacement().map(|n| n.id), Some(c.id));

    // a bad node gives its seat to the newcomer
    bucket.get_mut(&a.id).unwrap().fail();
    bucket.get_mut(&a.id).unwrap().fail();
    let d = Node::new(low_id(4), local(4));
    assert_eq!(bucket.add(d.clone()), BucketAdd::Replaced);
    assert!(bucket.get(&a.id).is_none());
    assert!(bucket.get(&d.id).is_some());
}

#[test]
fn test_bucket_split_partitions() {
    let mut bucket = full_range_bucket(4);

    let members = [low_id(1), low_id(2), high_id(1), high_id(2)];
    for (i, id) in members.iter().enumerate() {
        bucket.add(Node::new(*id, local(i as u16 + 1)));
    }
    let replacement = Node::new(high_id(3), local(9));
    assert_eq!(bucket.add(replacement.clone()), BucketAdd::Full);

    let (lower, upper) = bucket.split();

    // ranges tile the parent at the midpoint
    assert_eq!(lower.min(), &BigUint::from(0u8));
    assert_eq!(lower.max(), &(BigUint::from(1u8) << 159));
    assert_eq!(upper.min(), &(BigUint::from(1u8) << 159));
    assert_eq!(upper.max(), &(BigUint::from(1u8) << 160));

    // nodes plus the replacement are conserved across the children
    let lower_ids: Vec<NodeId> = lower.nodes().iter().map(|n| n.id).collect();
    let upper_ids: Vec<NodeId> = upper.nodes().iter().map(|n| n.id).collect();
    assert_eq!(lower_ids, vec![low_id(1), low_id(2)]);
    assert_eq!(upper_ids.len(), 3);
    assert!(upper_ids.contains(&replacement.id));
}

#[test]
fn test_bucket_refuses_narrow_split() {
    let narrow = Bucket::new(BigUint::from(0u8), BigUint::from(4u8), 8);
    assert!(!narrow.can_split());

    let wide = full_range_bucket(8);
    assert!(wide.can_split());
}

// ============================================================================
// Routing table
// ============================================================================

#[test]
fn test_routing_table_add_and_find() {
    let table = RoutingTable::new(NodeId::generate(), 8);

    let node = Node::new(NodeId::generate(), local(6881));
    assert!(matches!(table.add(node.clone()), AddOutcome::Added));
    assert_eq!(table.count_nodes(), 1);

    let found = table.find_node(&node.id).unwrap();
    assert_eq!(found.id, node.id);
    assert_eq!(found.addr, node.addr);

    // re-adding refreshes instead of duplicating
    assert!(matches!(table.add(node.clone()), AddOutcome::Updated));
    assert_eq!(table.count_nodes(), 1);

    table.remove(&node.id);
    assert!(table.find_node(&node.id).is_none());
    assert_eq!(table.count_nodes(), 0);

    table.add(Node::new(NodeId::generate(), local(6882)));
    table.clear();
    assert_eq!(table.count_nodes(), 0);
    assert_eq!(table.bucket_count(), 1);
}

#[test]
fn test_routing_table_rejects_self() {
    let our_id = NodeId::generate();
    let table = RoutingTable::new(our_id, 8);
    assert!(matches!(
        table.add(Node::new(our_id, local(6881))),
        AddOutcome::Rejected
    ));
    assert_eq!(table.count_nodes(), 0);
}

#[test]
fn test_routing_table_splits_bucket_containing_us() {
    // our ID is all zeros; nine low IDs overfill the first bucket
    let table = RoutingTable::new(NodeId([0u8; 20]), 8);

    for i in 1..=9u8 {
        table.add(Node::new(low_id(i), local(i as u16)));
    }

    // the ninth insert split the table; one retry later it is the pending
    // replacement of the still-crowded half
    assert!(table.bucket_count() >= 2);
    assert_eq!(table.count_nodes(), 8);

    // the bucket containing us shrank to [0, 2^159) or below
    let ranges = table.bucket_ranges();
    let ours = ranges
        .iter()
        .find(|(min, max)| {
            let zero = BigUint::from(0u8);
            *min <= zero && zero < *max
        })
        .unwrap();
    assert!(&ours.1 - &ours.0 <= BigUint::from(1u8) << 159);
}

#[test]
fn test_routing_table_never_splits_remote_bucket() {
    // our ID sits in the lower half; the upper-half bucket fills and stays put
    let table = RoutingTable::new(NodeId([0u8; 20]), 2);

    table.add(Node::new(high_id(1), local(1)));
    table.add(Node::new(high_id(2), local(2)));
    // the root bucket contains us, so this add splits once, leaving the
    // upper half full
    table.add(Node::new(high_id(3), local(3)));

    let outcome = table.add(Node::new(high_id(4), local(4)));
    match outcome {
        AddOutcome::Pending { ref to_ping } => {
            assert!(table.find_node(&to_ping.id).is_some());
        }
        other => panic!("expected Pending, got {:?}", other),
    }
}

#[test]
fn test_routing_table_get_closest() {
    let table = RoutingTable::new(NodeId::generate(), 8);
    let target = NodeId::generate();

    let mut inserted = Vec::new();
    for i in 0..100u16 {
        let node = Node::new(NodeId::generate(), local(1000 + i));
        if matches!(table.add(node.clone()), AddOutcome::Added) {
            inserted.push(node.id);
        }
    }

    let closest = table.get_closest(&target);
    assert_eq!(closest.len(), 8);

    // ascending distance, no duplicates
    for pair in closest.windows(2) {
        assert!(pair[0].id.distance(&target) < pair[1].id.distance(&target));
    }

    // exactly the 8 smallest distances among the retained nodes
    let mut expected: Vec<NodeId> = inserted;
    expected.sort_by_key(|id| id.distance(&target));
    expected.truncate(8);
    let got: Vec<NodeId> = closest.iter().map(|n| n.id).collect();
    assert_eq!(got, expected);
}

#[test]
fn test_routing_table_replacement_promotion() {
    let table = RoutingTable::new(NodeId([0u8; 20]), 2);

    table.add(Node::new(high_id(1), local(1)));
    table.add(Node::new(high_id(2), local(2)));
    table.add(Node::new(high_id(3), local(3)));

    let AddOutcome::Pending { to_ping } = table.add(Node::new(high_id(4), local(4))) else {
        panic!("expected Pending");
    };

    // two unanswered pings make the stale node bad; promotion evicts it
    table.mark_failed(&to_ping.id);
    table.mark_failed(&to_ping.id);
    assert!(table.promote_replacement(&to_ping.id));

    assert!(table.find_node(&to_ping.id).is_none());
    assert!(table.find_node(&high_id(4)).is_some());
}

#[test]
fn test_routing_table_replacement_discarded() {
    let table = RoutingTable::new(NodeId([0u8; 20]), 2);

    table.add(Node::new(high_id(1), local(1)));
    table.add(Node::new(high_id(2), local(2)));
    table.add(Node::new(high_id(3), local(3)));

    let AddOutcome::Pending { to_ping } = table.add(Node::new(high_id(4), local(4))) else {
        panic!("expected Pending");
    };

    // the pinged node answered; the replacement is dropped
    table.discard_replacement(&to_ping.id);
    assert!(table.find_node(&to_ping.id).is_some());
    assert!(table.find_node(&high_id(4)).is_none());
    assert!(!table.promote_replacement(&to_ping.id));
}

#[tokio::test]
async fn test_routing_table_node_added_events() {
    let table = RoutingTable::new(NodeId::generate(), 8);
    let mut events = table.subscribe();

    let node = Node::new(NodeId::generate(), local(1));
    table.add(node.clone());
    // refresh must not re-notify
    table.add(node.clone());

    let DhtEvent::NodeAdded(added) = events.recv().await.unwrap();
    assert_eq!(added.id, node.id);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_routing_table_persistence() {
    // first bytes spread over the space so every insert lands in a bucket
    // with room on both the original and the reloaded table
    let first_bytes: [u8; 20] = [
        0x00, 0x10, 0x20, 0x30, 0x40, 0x50, 0x60, 0x70, 0x80, 0x88, 0x90, 0x98, 0xA0, 0xA8, 0xB0,
        0xB8, 0xC0, 0xD0, 0xE0, 0xF0,
    ];

    let table = RoutingTable::new(NodeId([0xFF; 20]), 8);
    for (i, first) in first_bytes.iter().enumerate() {
        let mut id = [0u8; 20];
        id[0] = *first;
        table.add(Node::new(NodeId(id), local(2000 + i as u16)));
    }
    assert_eq!(table.count_nodes(), 20);

    let saved = table.save().unwrap();

    let restored = RoutingTable::new(*table.our_id(), 8);
    let mut events = restored.subscribe();
    let loaded = restored.load(&saved).unwrap();

    assert_eq!(loaded, 20);
    assert_eq!(restored.count_nodes(), 20);
    for node in table.all_nodes() {
        assert!(restored.find_node(&node.id).is_some());
    }

    // loading is silent
    assert!(events.try_recv().is_err());
}

// ============================================================================
// Messages
// ============================================================================

#[test]
fn test_message_ping_roundtrip() {
    let our_id = NodeId::generate();
    let tid = Bytes::from_static(b"aa");

    let msg = DhtMessage::ping(tid.clone(), &our_id);
    let encoded = msg.encode().unwrap();

    let parsed = DhtMessage::parse(&encoded).unwrap();
    assert_eq!(parsed.transaction_id, tid);
    assert_eq!(parsed.sender_id, Some(our_id));
    assert_eq!(
        parsed.version.as_deref(),
        Some(crate::constants::CLIENT_VERSION.as_slice())
    );
    assert!(matches!(parsed.query, Some((_, DhtQuery::Ping))));
}

#[test]
fn test_message_find_node_roundtrip() {
    let our_id = NodeId::generate();
    let target = NodeId::generate();
    let tid = Bytes::from_static(b"bb");

    let msg = DhtMessage::find_node(tid.clone(), &our_id, target);
    let parsed = DhtMessage::parse(&msg.encode().unwrap()).unwrap();

    match parsed.query {
        Some((name, DhtQuery::FindNode { target: t })) => {
            assert_eq!(name, "find_node");
            assert_eq!(t, target);
        }
        other => panic!("wrong query: {:?}", other),
    }
}

#[test]
fn test_message_announce_roundtrip() {
    let our_id = NodeId::generate();
    let tid = Bytes::from_static(b"cc");
    let token = Bytes::from_static(b"secret01");

    let msg = DhtMessage::announce_peer(tid, &our_id, [0xAB; 20], 7000, token.clone(), true);
    let parsed = DhtMessage::parse(&msg.encode().unwrap()).unwrap();

    match parsed.query {
        Some((
            _,
            DhtQuery::AnnouncePeer {
                info_hash,
                port,
                token: t,
                implied_port,
            },
        )) => {
            assert_eq!(info_hash, [0xAB; 20]);
            assert_eq!(port, 7000);
            assert_eq!(t, token);
            assert!(implied_port);
        }
        other => panic!("wrong query: {:?}", other),
    }
}

#[test]
fn test_message_get_peers_response_exactly_one_of() {
    let id = NodeId::generate();
    let token = Bytes::from_static(b"tok");

    // peers known: values on the wire, no nodes
    let with_peers = DhtMessage::response(
        Bytes::from_static(b"dd"),
        DhtResponse::GetPeers {
            id,
            token: token.clone(),
            peers: Some(vec![local(42)]),
            nodes: Some(vec![Node::new(NodeId::generate(), local(43))]),
        },
    );
    let encoded = with_peers.encode().unwrap();
    let value = crate::bencode::decode(&encoded).unwrap();
    let reply = value.get(b"r").unwrap();
    assert!(reply.get(b"values").is_some());
    assert!(reply.get(b"nodes").is_none());

    match DhtMessage::parse(&encoded).unwrap().response {
        Some(DhtResponse::GetPeers { peers, .. }) => {
            assert_eq!(peers.unwrap(), vec![local(42)]);
        }
        other => panic!("wrong response: {:?}", other),
    }

    // no peers: closest nodes instead
    let with_nodes = DhtMessage::response(
        Bytes::from_static(b"ee"),
        DhtResponse::GetPeers {
            id,
            token,
            peers: None,
            nodes: Some(vec![Node::new(NodeId::generate(), local(43))]),
        },
    );
    let value = crate::bencode::decode(&with_nodes.encode().unwrap()).unwrap();
    let reply = value.get(b"r").unwrap();
    assert!(reply.get(b"values").is_none());
    assert!(reply.get(b"nodes").is_some());
}

#[test]
fn test_message_error_roundtrip() {
    let msg = DhtMessage::error(Bytes::from_static(b"ff"), 203, "Invalid token");
    let parsed = DhtMessage::parse(&msg.encode().unwrap()).unwrap();

    match parsed.response {
        Some(DhtResponse::Error { code, message }) => {
            assert_eq!(code, 203);
            assert_eq!(message, "Invalid token");
        }
        other => panic!("wrong response: {:?}", other),
    }
}

#[test]
fn test_response_classified_by_query_kind() {
    let id = NodeId::generate();

    // a bare {id} ack parses as Ping; the recorded query kind settles it
    let ack = DhtResponse::Ping { id };
    assert!(matches!(
        ack.classify(QueryKind::AnnouncePeer),
        DhtResponse::AnnouncePeer { .. }
    ));

    // a token-bearing reply to a find_node still yields its contacts
    let parsed = DhtResponse::GetPeers {
        id,
        token: Bytes::from_static(b"t"),
        peers: None,
        nodes: Some(vec![Node::new(NodeId::generate(), local(7))]),
    };
    match parsed.classify(QueryKind::FindNode) {
        DhtResponse::FindNode { nodes, .. } => assert_eq!(nodes.len(), 1),
        other => panic!("wrong response: {:?}", other),
    }

    // errors pass through untouched
    let err = DhtResponse::Error {
        code: 201,
        message: "oops".to_string(),
    };
    assert!(matches!(
        err.classify(QueryKind::Ping),
        DhtResponse::Error { code: 201, .. }
    ));
}

#[test]
fn test_message_unknown_method() {
    let mut args = BTreeMap::new();
    args.insert(
        Bytes::from_static(b"id"),
        crate::bencode::Value::Bytes(Bytes::copy_from_slice(&[7u8; 20])),
    );
    let mut dict = BTreeMap::new();
    dict.insert(
        Bytes::from_static(b"a"),
        crate::bencode::Value::Dict(args),
    );
    dict.insert(
        Bytes::from_static(b"q"),
        crate::bencode::Value::string("sample_infohashes"),
    );
    dict.insert(Bytes::from_static(b"t"), crate::bencode::Value::string("gg"));
    dict.insert(Bytes::from_static(b"y"), crate::bencode::Value::string("q"));
    let raw = crate::bencode::encode(&crate::bencode::Value::Dict(dict)).unwrap();

    let parsed = DhtMessage::parse(&raw).unwrap();
    assert!(matches!(parsed.query, Some((_, DhtQuery::Unknown))));
}

// ============================================================================
// Tokens
// ============================================================================

#[test]
fn test_token_stable_within_epoch() {
    let tokens = TokenManager::new();
    let n = local(25);

    let t1 = tokens.generate(&n);
    let t2 = tokens.generate(&n);
    assert_eq!(t1, t2);
    assert!(tokens.verify(&n, &t1));
}

#[test]
fn test_token_bound_to_ip_not_port() {
    let tokens = TokenManager::new();

    let t = tokens.generate(&local(25));
    assert!(tokens.verify(&local(9999), &t));
    assert!(!tokens.verify(&addr([127, 0, 0, 2], 25), &t));
}

#[test]
fn test_token_survives_one_rotation_only() {
    let tokens = TokenManager::new();
    let n = local(25);

    let t = tokens.generate(&n);
    tokens.rotate();
    assert!(tokens.verify(&n, &t));

    tokens.rotate();
    assert!(!tokens.verify(&n, &t));
}

// ============================================================================
// RPC engine
// ============================================================================

async fn test_engine(timeout: Duration, max_in_flight: usize) -> (Arc<RpcEngine>, Arc<RoutingTable>) {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let table = Arc::new(RoutingTable::new(NodeId::generate(), 8));
    let engine = Arc::new(RpcEngine::new(
        socket,
        table.clone(),
        timeout,
        max_in_flight,
    ));
    (engine, table)
}

/// A localhost port with nothing behind it; sends succeed, replies never come.
async fn black_hole() -> (UdpSocket, SocketAddrV4) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    (socket, local(port))
}

#[tokio::test]
async fn test_rpc_timeout_marks_node_failed() {
    let (engine, table) = test_engine(Duration::from_millis(100), 16).await;
    let (_keep, sink) = black_hole().await;

    let id = NodeId::generate();
    table.add(Node::new(id, sink));

    let our_id = *table.our_id();
    let result = engine
        .call(sink, Some(id), QueryKind::Ping, |tid| {
            DhtMessage::ping(tid, &our_id)
        })
        .await;

    assert!(matches!(result, Err(DhtError::Timeout)));
    assert_eq!(table.find_node(&id).unwrap().failures, 1);
    assert_eq!(engine.pending_count(), 0);
}

#[tokio::test]
async fn test_rpc_busy_at_ceiling() {
    let (engine, table) = test_engine(Duration::from_secs(5), 1).await;
    let (_keep, sink) = black_hole().await;
    let our_id = *table.our_id();

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .call(sink, None, QueryKind::Ping, |tid| {
                    DhtMessage::ping(tid, &our_id)
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.pending_count(), 1);

    let second = engine
        .call(sink, None, QueryKind::Ping, |tid| {
            DhtMessage::ping(tid, &our_id)
        })
        .await;
    assert!(matches!(second, Err(DhtError::Busy)));

    first.abort();
}

#[tokio::test]
async fn test_rpc_sweep_completes_overdue() {
    let (engine, table) = test_engine(Duration::from_secs(30), 16).await;
    let (_keep, sink) = black_hole().await;
    let our_id = *table.our_id();

    let call = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .call(sink, None, QueryKind::Ping, |tid| {
                    DhtMessage::ping(tid, &our_id)
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.pending_count(), 1);

    // a sweep from the future completes the request with a timeout
    engine.sweep(std::time::Instant::now() + Duration::from_secs(31));
    assert_eq!(engine.pending_count(), 0);

    let result = call.await.unwrap();
    assert!(matches!(result, Err(DhtError::Timeout)));
}

// ============================================================================
// Server scenarios
// ============================================================================

#[tokio::test]
async fn test_server_ping() {
    let a = spawn_server(test_config()).await;
    let b = spawn_server(test_config()).await;

    let response = a.ping(local(b.port())).await.unwrap();
    match response {
        DhtResponse::Ping { id } => assert_eq!(&id, b.our_id()),
        other => panic!("wrong response: {:?}", other),
    }

    // each side learned the other from the exchange
    assert!(a.routing_table().find_node(b.our_id()).is_some());
    assert!(b.routing_table().find_node(a.our_id()).is_some());
}

#[tokio::test]
async fn test_server_find_node_walks_the_graph() {
    let a = spawn_server(test_config()).await;
    let b = spawn_server(test_config()).await;
    let c = spawn_server(test_config()).await;

    // a knows b, b knows c
    a.ping(local(b.port())).await.unwrap();
    c.ping(local(b.port())).await.unwrap();

    let found = a.find_node(*c.our_id()).await.unwrap();
    assert!(found.iter().any(|n| &n.id == c.our_id()));
}

#[tokio::test]
async fn test_server_announce_and_get_peers() {
    let hub = spawn_server(test_config()).await;
    let announcer = spawn_server(test_config()).await;
    let seeker = spawn_server(test_config()).await;

    announcer.ping(local(hub.port())).await.unwrap();
    seeker.ping(local(hub.port())).await.unwrap();

    let info_hash = [0x42u8; 20];
    let accepted = announcer.announce(info_hash, Some(9000)).await.unwrap();
    assert!(accepted >= 1);

    let peers = seeker.get_peers(info_hash).await.unwrap();
    assert!(peers.contains(&local(9000)));
}

#[tokio::test]
async fn test_server_rejects_bogus_token() {
    let server = spawn_server(test_config()).await;

    // an announce with a token the server never issued
    let msg = DhtMessage::announce_peer(
        Bytes::from_static(b"xy"),
        &NodeId::generate(),
        [0x17u8; 20],
        9000,
        Bytes::from_static(b"bogus tok"),
        false,
    );
    let raw = msg.encode().unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(&raw, local(server.port())).await.unwrap();

    let mut buf = [0u8; 1500];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();

    let reply = DhtMessage::parse(&buf[..n]).unwrap();
    match reply.response {
        Some(DhtResponse::Error { code, .. }) => assert_eq!(code, super::message::ERROR_PROTOCOL),
        other => panic!("expected error reply, got {:?}", other),
    }
}

#[tokio::test]
async fn test_server_answers_unknown_method_with_204() {
    let server = spawn_server(test_config()).await;

    let mut args = BTreeMap::new();
    args.insert(
        Bytes::from_static(b"id"),
        crate::bencode::Value::Bytes(Bytes::copy_from_slice(&[9u8; 20])),
    );
    let mut dict = BTreeMap::new();
    dict.insert(Bytes::from_static(b"a"), crate::bencode::Value::Dict(args));
    dict.insert(
        Bytes::from_static(b"q"),
        crate::bencode::Value::string("vote"),
    );
    dict.insert(Bytes::from_static(b"t"), crate::bencode::Value::string("zz"));
    dict.insert(Bytes::from_static(b"y"), crate::bencode::Value::string("q"));
    let raw = crate::bencode::encode(&crate::bencode::Value::Dict(dict)).unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(&raw, local(server.port())).await.unwrap();

    let mut buf = [0u8; 1500];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();

    let reply = DhtMessage::parse(&buf[..n]).unwrap();
    match reply.response {
        Some(DhtResponse::Error { code, .. }) => assert_eq!(code, ERROR_METHOD_UNKNOWN),
        other => panic!("expected error reply, got {:?}", other),
    }
}

#[tokio::test]
async fn test_evict_check_promotes_replacement() {
    let table = Arc::new(RoutingTable::new(NodeId([0u8; 20]), 2));
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let rpc = Arc::new(RpcEngine::new(
        socket,
        table.clone(),
        Duration::from_millis(100),
        16,
    ));

    let (_keep, sink) = black_hole().await;
    table.add(Node::new(high_id(1), sink));
    table.add(Node::new(high_id(2), local(2)));
    table.add(Node::new(high_id(3), local(3)));

    let AddOutcome::Pending { to_ping } = table.add(Node::new(high_id(4), local(4))) else {
        panic!("expected Pending");
    };
    assert_eq!(to_ping.id, high_id(1));

    // the stale node answers nothing; two dropped pings promote the newcomer
    spawn_evict_check(table.clone(), rpc, to_ping.clone());
    tokio::time::sleep(Duration::from_millis(900)).await;

    assert!(table.find_node(&to_ping.id).is_none());
    assert!(table.find_node(&high_id(4)).is_some());
}

#[tokio::test]
async fn test_bootstrap_time_cap() {
    let mut config = test_config();
    config.bootstrap_nodes = vec!["127.0.0.1:9".to_string()];
    config.bootstrap_timeout = Duration::from_millis(200);
    config.rpc_timeout = Duration::from_millis(100);
    let server = spawn_server(config).await;

    let started = std::time::Instant::now();
    server.bootstrap().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(server.routing_table().bucket_count(), 1);
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let server = spawn_server(test_config()).await;
    server.shutdown();
    server.shutdown();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.routing_table().count_nodes(), 0);
}
