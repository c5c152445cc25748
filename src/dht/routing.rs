use std::collections::BTreeMap;

use bytes::Bytes;
use num_bigint::BigUint;
use parking_lot::RwLock;
use rand::Rng as _;
use tokio::sync::broadcast;

use super::bucket::{Bucket, BucketAdd};
use super::error::DhtError;
use super::node::{Node, NodeId};
use crate::bencode::{self, Value};
use crate::constants::BUCKET_REFRESH_INTERVAL;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Notifications emitted by the routing table.
#[derive(Debug, Clone)]
pub enum DhtEvent {
    /// A contact was inserted into the table (not merely refreshed).
    /// Delivered at most once per insertion.
    NodeAdded(Node),
}

/// Outcome of [`RoutingTable::add`].
#[derive(Debug, Clone)]
pub enum AddOutcome {
    /// The node went into a bucket with spare capacity (possibly after a
    /// split).
    Added,
    /// The node was already known; its last-seen time was refreshed.
    Updated,
    /// A bad node was evicted to make room.
    Replaced,
    /// The node's bucket is full of live nodes and was not eligible for a
    /// split. The node is stashed as the bucket's replacement; the caller
    /// should ping `to_ping` and then promote or discard the replacement
    /// according to the result.
    Pending { to_ping: Node },
    /// The node is our own contact and was ignored.
    Rejected,
}

/// The Kademlia routing table.
///
/// An ordered list of buckets partitions the full ID space `[0, 2^160)`;
/// every ID falls in exactly one bucket. The table starts as a single bucket
/// spanning the whole range, and a full bucket splits at its midpoint while
/// it still contains our own ID. Buckets never merge, and buckets that do
/// not contain us never split, which bounds the tree depth at 160.
///
/// All structural mutation happens under one internal lock, so concurrent
/// adds racing toward the same splitting bucket serialize cleanly.
pub struct RoutingTable {
    our_id: NodeId,
    k: usize,
    buckets: RwLock<Vec<Bucket>>,
    events: broadcast::Sender<DhtEvent>,
}

impl RoutingTable {
    pub fn new(our_id: NodeId, k: usize) -> Self {
        let full_range = Bucket::new(BigUint::from(0u8), BigUint::from(1u8) << 160, k);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            our_id,
            k,
            buckets: RwLock::new(vec![full_range]),
            events,
        }
    }

    pub fn our_id(&self) -> &NodeId {
        &self.our_id
    }

    /// Subscribes to table notifications.
    ///
    /// Multiple subscribers each see every event; ordering across
    /// subscribers is not guaranteed.
    pub fn subscribe(&self) -> broadcast::Receiver<DhtEvent> {
        self.events.subscribe()
    }

    /// Offers a contact to the table.
    pub fn add(&self, node: Node) -> AddOutcome {
        self.insert(node, true)
    }

    pub(crate) fn insert(&self, node: Node, notify: bool) -> AddOutcome {
        if node.id == self.our_id {
            return AddOutcome::Rejected;
        }

        let outcome = self.insert_locked(&node);

        if notify && matches!(outcome, AddOutcome::Added | AddOutcome::Replaced) {
            let _ = self.events.send(DhtEvent::NodeAdded(node));
        }

        outcome
    }

    fn insert_locked(&self, node: &Node) -> AddOutcome {
        let mut buckets = self.buckets.write();
        let mut split_once = false;

        loop {
            let idx = match buckets.iter().position(|b| b.can_contain(&node.id)) {
                Some(idx) => idx,
                None => return AddOutcome::Rejected,
            };

            match buckets[idx].add(node.clone()) {
                BucketAdd::Added => return AddOutcome::Added,
                BucketAdd::Updated => return AddOutcome::Updated,
                BucketAdd::Replaced => return AddOutcome::Replaced,
                BucketAdd::Full => {
                    let splittable = !split_once
                        && buckets[idx].can_contain(&self.our_id)
                        && buckets[idx].can_split();

                    if splittable {
                        // pull the node we just stashed back out; the retry
                        // below re-adds it to the proper half
                        buckets[idx].take_replacement();

                        let old = buckets.remove(idx);
                        let (lower, upper) = old.split();
                        buckets.insert(idx, lower);
                        buckets.insert(idx + 1, upper);

                        split_once = true;
                        continue;
                    }

                    // a full bucket is never empty
                    return match buckets[idx].least_recently_seen() {
                        Some(lrs) => AddOutcome::Pending {
                            to_ping: lrs.clone(),
                        },
                        None => AddOutcome::Rejected,
                    };
                }
            }
        }
    }

    pub fn remove(&self, id: &NodeId) -> Option<Node> {
        self.bucket_for_mut(id, |bucket| bucket.remove(id)).flatten()
    }

    pub fn find_node(&self, id: &NodeId) -> Option<Node> {
        let buckets = self.buckets.read();
        buckets
            .iter()
            .find(|b| b.can_contain(id))
            .and_then(|b| b.get(id))
            .cloned()
    }

    /// Up to K nodes closest to `target`, ascending by XOR distance.
    ///
    /// Bad nodes are excluded; ties (which only arise for identical IDs)
    /// break toward the smaller ID.
    pub fn get_closest(&self, target: &NodeId) -> Vec<Node> {
        let buckets = self.buckets.read();

        let mut candidates: Vec<(NodeId, Node)> = buckets
            .iter()
            .flat_map(|b| b.nodes())
            .filter(|n| !n.is_bad())
            .map(|n| (n.id.distance(target), n.clone()))
            .collect();

        candidates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        candidates.truncate(self.k);
        candidates.into_iter().map(|(_, n)| n).collect()
    }

    pub fn count_nodes(&self) -> usize {
        self.buckets.read().iter().map(|b| b.nodes().len()).sum()
    }

    pub fn all_nodes(&self) -> Vec<Node> {
        self.buckets
            .read()
            .iter()
            .flat_map(|b| b.nodes().iter().cloned())
            .collect()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }

    /// The `[min, max)` ranges of all buckets, ascending.
    pub fn bucket_ranges(&self) -> Vec<(BigUint, BigUint)> {
        self.buckets
            .read()
            .iter()
            .map(|b| (b.min().clone(), b.max().clone()))
            .collect()
    }

    pub fn clear(&self) {
        let mut buckets = self.buckets.write();
        buckets.clear();
        buckets.push(Bucket::new(
            BigUint::from(0u8),
            BigUint::from(1u8) << 160,
            self.k,
        ));
    }

    /// Records an unanswered query against a node. The node stays in its
    /// bucket; once bad it is the first eviction candidate.
    pub fn mark_failed(&self, id: &NodeId) {
        self.bucket_for_mut(id, |bucket| {
            if let Some(node) = bucket.get_mut(id) {
                node.fail();
            }
        });
    }

    /// Records a successful exchange with a node.
    pub fn mark_seen(&self, id: &NodeId) {
        self.bucket_for_mut(id, |bucket| {
            if let Some(node) = bucket.get_mut(id) {
                node.touch();
                bucket.sort_by_last_seen();
            }
        });
    }

    /// Remembers the announce token a node sent us.
    pub fn update_token(&self, id: &NodeId, token: Bytes) {
        self.bucket_for_mut(id, |bucket| {
            if let Some(node) = bucket.get_mut(id) {
                node.last_token = Some(token);
            }
        });
    }

    /// Evicts `id` and promotes its bucket's pending replacement.
    pub fn promote_replacement(&self, id: &NodeId) -> bool {
        self.bucket_for_mut(id, |bucket| bucket.promote_replacement(id))
            .unwrap_or(false)
    }

    /// Drops the pending replacement in `id`'s bucket; the pinged node
    /// answered and keeps its seat.
    pub fn discard_replacement(&self, id: &NodeId) {
        self.bucket_for_mut(id, |bucket| {
            bucket.take_replacement();
            if let Some(node) = bucket.get_mut(id) {
                node.touch();
                bucket.sort_by_last_seen();
            }
        });
    }

    /// Random lookup targets inside every bucket that has been idle past
    /// the refresh interval.
    pub fn refresh_targets(&self) -> Vec<NodeId> {
        let buckets = self.buckets.read();

        buckets
            .iter()
            .filter(|b| !b.nodes().is_empty() && b.last_changed().elapsed() > BUCKET_REFRESH_INTERVAL)
            .map(|b| {
                let mut raw = [0u8; 20];
                rand::rng().fill(&mut raw);
                let span = b.max() - b.min();
                let target = b.min() + BigUint::from_bytes_be(&raw) % span;
                NodeId::from_uint(&target)
            })
            .collect()
    }

    /// Serializes the table as `{"nodes": <compact contacts>, "self": <id>}`.
    pub fn save(&self) -> Result<Vec<u8>, DhtError> {
        let buckets = self.buckets.read();

        let mut compact = Vec::new();
        for bucket in buckets.iter() {
            for node in bucket.nodes() {
                compact.extend_from_slice(&node.to_compact());
            }
        }

        let mut dict = BTreeMap::new();
        dict.insert(Bytes::from_static(b"nodes"), Value::Bytes(Bytes::from(compact)));
        dict.insert(
            Bytes::from_static(b"self"),
            Value::Bytes(Bytes::copy_from_slice(self.our_id.as_bytes())),
        );

        Ok(bencode::encode(&Value::Dict(dict))?)
    }

    /// Reloads contacts saved with [`save`](Self::save), inserting them
    /// without emitting notifications. Returns how many were inserted.
    pub fn load(&self, data: &[u8]) -> Result<usize, DhtError> {
        let value = bencode::decode(data)?;
        let compact = value
            .get(b"nodes")
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| DhtError::InvalidMessage("missing nodes in saved table".into()))?;

        let mut count = 0;
        for chunk in compact.chunks_exact(26) {
            if let Some(node) = Node::from_compact(chunk) {
                if matches!(
                    self.insert(node, false),
                    AddOutcome::Added | AddOutcome::Replaced
                ) {
                    count += 1;
                }
            }
        }

        Ok(count)
    }

    fn bucket_for_mut<T>(&self, id: &NodeId, f: impl FnOnce(&mut Bucket) -> T) -> Option<T> {
        let mut buckets = self.buckets.write();
        buckets.iter_mut().find(|b| b.can_contain(id)).map(f)
    }
}
