use num_bigint::BigUint;
use std::time::Instant;

use super::node::{Node, NodeId};

/// Outcome of [`Bucket::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BucketAdd {
    /// The node was already present; its last-seen time was refreshed.
    Updated,
    /// The node was appended to a bucket with spare capacity.
    Added,
    /// A bad node was evicted to make room.
    Replaced,
    /// The bucket is full of non-bad nodes; the node was stashed as the
    /// pending replacement (overwriting any prior one).
    Full,
}

/// A k-bucket covering the half-open ID range `[min, max)`.
///
/// Holds up to `k` live nodes ordered by ascending last-seen, plus at most
/// one pending replacement. Ranges are `BigUint` because the root bucket's
/// upper bound is 2^160, one past the largest representable ID.
#[derive(Debug)]
pub(crate) struct Bucket {
    min: BigUint,
    max: BigUint,
    k: usize,
    nodes: Vec<Node>,
    replacement: Option<Node>,
    last_changed: Instant,
}

impl Bucket {
    pub fn new(min: BigUint, max: BigUint, k: usize) -> Self {
        Self {
            min,
            max,
            k,
            nodes: Vec::with_capacity(k),
            replacement: None,
            last_changed: Instant::now(),
        }
    }

    pub fn min(&self) -> &BigUint {
        &self.min
    }

    pub fn max(&self) -> &BigUint {
        &self.max
    }

    pub fn can_contain(&self, id: &NodeId) -> bool {
        let value = id.to_uint();
        self.min <= value && value < self.max
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn replacement(&self) -> Option<&Node> {
        self.replacement.as_ref()
    }

    pub fn last_changed(&self) -> Instant {
        self.last_changed
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| &n.id == id)
    }

    /// The least-recently-seen live node, the one to ping before an eviction.
    pub fn least_recently_seen(&self) -> Option<&Node> {
        self.nodes.first()
    }

    pub fn add(&mut self, node: Node) -> BucketAdd {
        if let Some(existing) = self.get_mut(&node.id) {
            existing.touch();
            if node.last_token.is_some() {
                existing.last_token = node.last_token;
            }
            self.sort_by_last_seen();
            return BucketAdd::Updated;
        }

        if self.nodes.len() < self.k {
            self.nodes.push(node);
            self.sort_by_last_seen();
            self.last_changed = Instant::now();
            return BucketAdd::Added;
        }

        // nodes are ordered by last-seen, so the first bad one is the worst
        if let Some(pos) = self.nodes.iter().position(Node::is_bad) {
            self.nodes.remove(pos);
            self.nodes.push(node);
            self.sort_by_last_seen();
            self.last_changed = Instant::now();
            return BucketAdd::Replaced;
        }

        self.replacement = Some(node);
        BucketAdd::Full
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<Node> {
        let pos = self.nodes.iter().position(|n| &n.id == id)?;
        Some(self.nodes.remove(pos))
    }

    pub fn take_replacement(&mut self) -> Option<Node> {
        self.replacement.take()
    }

    /// Evicts `id` and inserts the pending replacement in its place.
    ///
    /// Returns false if there is no replacement or `id` is not present,
    /// in which case the bucket is unchanged.
    pub fn promote_replacement(&mut self, id: &NodeId) -> bool {
        if self.replacement.is_none() || self.get(id).is_none() {
            return false;
        }
        self.remove(id);
        if let Some(replacement) = self.replacement.take() {
            self.nodes.push(replacement);
            self.sort_by_last_seen();
            self.last_changed = Instant::now();
        }
        true
    }

    pub fn sort_by_last_seen(&mut self) {
        self.nodes.sort_by_key(|n| n.last_seen);
    }

    /// Whether this bucket may be split.
    ///
    /// Splitting is refused once the range's span drops below `k`, which
    /// breaks the infinite recursion that colliding IDs at one extreme
    /// would otherwise cause.
    pub fn can_split(&self) -> bool {
        &self.max - &self.min >= BigUint::from(self.k)
    }

    /// Splits at the range midpoint into `[min, mid)` and `[mid, max)`,
    /// redistributing the nodes and the pending replacement.
    pub fn split(self) -> (Bucket, Bucket) {
        let mid: BigUint = (&self.min + &self.max) >> 1;
        let mut lower = Bucket::new(self.min, mid.clone(), self.k);
        let mut upper = Bucket::new(mid, self.max, self.k);

        for node in self.nodes {
            if lower.can_contain(&node.id) {
                lower.nodes.push(node);
            } else {
                upper.nodes.push(node);
            }
        }
        lower.sort_by_last_seen();
        upper.sort_by_last_seen();

        if let Some(replacement) = self.replacement {
            let side = if lower.can_contain(&replacement.id) {
                &mut lower
            } else {
                &mut upper
            };
            side.add(replacement);
        }

        (lower, upper)
    }
}
