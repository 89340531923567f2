//! Search node storage and the open list used by graph searches
//!
//! Nodes live in a fixed size pool and are addressed by slot index. Parent
//! links are stored as a 1-based index where 0 means "no
//! parent", so a node can be stored without an `Option`.

use navtile_common::next_pow2;

use super::PolyRef;

bitflags::bitflags! {
    /// Search state of a node
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeFlags: u8 {
        const OPEN = 0x01;
        const CLOSED = 0x02;
        /// Parent is not adjacent; the path to it is found by a raycast
        const PARENT_DETACHED = 0x04;
    }
}

/// Slot index of a node in its pool
pub type NodeIndex = usize;

/// Maximum number of states stored per polygon
pub const MAX_STATES_PER_NODE: u8 = 4;

/// Node of a graph search
#[derive(Debug, Clone, Default)]
pub struct Node {
    /// Position of the node on its polygon
    pub pos: [f32; 3],
    /// Cost from the parent to this node
    pub cost: f32,
    /// Total cost including the heuristic
    pub total: f32,
    /// 1-based parent index, 0 for none
    pub pidx: u32,
    /// Extra state (0..MAX_STATES_PER_NODE)
    pub state: u8,
    pub flags: NodeFlags,
    /// Polygon the node stands for
    pub id: PolyRef,
    /// Polygons crossed by the raycast from the parent, when detached
    pub shortcut: Option<Vec<PolyRef>>,
}

/// Bounded pool of search nodes with a hash index on `(id, state)`
#[derive(Debug)]
pub struct NodePool {
    nodes: Vec<Node>,
    first: Vec<Option<NodeIndex>>,
    next: Vec<Option<NodeIndex>>,
    max_nodes: usize,
    node_count: usize,
}

impl NodePool {
    /// Creates a pool; `hash_size` is rounded up to a power of two
    pub fn new(max_nodes: usize, hash_size: usize) -> Self {
        let hash_size = next_pow2(hash_size.max(1) as u32) as usize;
        Self {
            nodes: vec![Node::default(); max_nodes],
            first: vec![None; hash_size],
            next: vec![None; max_nodes],
            max_nodes,
            node_count: 0,
        }
    }

    pub fn clear(&mut self) {
        self.first.fill(None);
        self.node_count = 0;
    }

    fn bucket(&self, id: PolyRef) -> usize {
        let mut a = id.id();
        a = a.wrapping_add(!(a << 15));
        a ^= a >> 10;
        a = a.wrapping_add(a << 3);
        a ^= a >> 6;
        a = a.wrapping_add(!(a << 11));
        a ^= a >> 16;
        (a as usize) & (self.first.len() - 1)
    }

    /// Finds the node for `(id, state)`, allocating it when missing
    ///
    /// Returns `None` once the pool is exhausted.
    pub fn get_node(&mut self, id: PolyRef, state: u8) -> Option<NodeIndex> {
        if let Some(idx) = self.find_node(id, state) {
            return Some(idx);
        }

        if self.node_count >= self.max_nodes {
            return None;
        }

        let idx = self.node_count;
        self.node_count += 1;

        self.nodes[idx] = Node {
            id,
            state,
            ..Node::default()
        };

        let bucket = self.bucket(id);
        self.next[idx] = self.first[bucket];
        self.first[bucket] = Some(idx);

        Some(idx)
    }

    /// Finds an existing node for `(id, state)`
    pub fn find_node(&self, id: PolyRef, state: u8) -> Option<NodeIndex> {
        let mut cur = self.first[self.bucket(id)];
        while let Some(idx) = cur {
            let node = &self.nodes[idx];
            if node.id == id && node.state == state {
                return Some(idx);
            }
            cur = self.next[idx];
        }
        None
    }

    /// Finds up to `max_nodes` nodes of a polygon, whatever their state
    pub fn find_nodes(&self, id: PolyRef, max_nodes: usize) -> Vec<NodeIndex> {
        let mut result = Vec::new();
        let mut cur = self.first[self.bucket(id)];
        while let Some(idx) = cur {
            if result.len() >= max_nodes {
                break;
            }
            if self.nodes[idx].id == id {
                result.push(idx);
            }
            cur = self.next[idx];
        }
        result
    }

    #[inline]
    pub fn node(&self, idx: NodeIndex) -> &Node {
        &self.nodes[idx]
    }

    #[inline]
    pub fn node_mut(&mut self, idx: NodeIndex) -> &mut Node {
        &mut self.nodes[idx]
    }

    /// 1-based index of a node, for storing in `pidx`
    #[inline]
    pub fn get_node_idx(&self, idx: NodeIndex) -> u32 {
        idx as u32 + 1
    }

    /// Slot of a 1-based parent index
    #[inline]
    pub fn get_node_at_idx(&self, pidx: u32) -> Option<NodeIndex> {
        if pidx == 0 || pidx as usize > self.node_count {
            None
        } else {
            Some(pidx as usize - 1)
        }
    }

    /// Parent slot of a node
    #[inline]
    pub fn parent_of(&self, idx: NodeIndex) -> Option<NodeIndex> {
        self.get_node_at_idx(self.nodes[idx].pidx)
    }

    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }

    pub fn hash_size(&self) -> usize {
        self.first.len()
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }
}

/// Binary min-heap of node slots keyed by `Node::total`
#[derive(Debug)]
pub struct NodeQueue {
    heap: Vec<NodeIndex>,
}

impl NodeQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
        }
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Cheapest node without removing it
    pub fn top(&self) -> Option<NodeIndex> {
        self.heap.first().copied()
    }

    /// Removes and returns the cheapest node
    pub fn pop(&mut self, pool: &NodePool) -> Option<NodeIndex> {
        let top = *self.heap.first()?;
        let last = self.heap.pop()?;
        if !self.heap.is_empty() {
            self.trickle_down(0, last, pool);
        }
        Some(top)
    }

    pub fn push(&mut self, idx: NodeIndex, pool: &NodePool) {
        self.heap.push(idx);
        self.bubble_up(self.heap.len() - 1, idx, pool);
    }

    /// Restores heap order after the total of `idx` decreased
    pub fn modify(&mut self, idx: NodeIndex, pool: &NodePool) {
        if let Some(i) = self.heap.iter().position(|&n| n == idx) {
            self.bubble_up(i, idx, pool);
        }
    }

    fn bubble_up(&mut self, mut i: usize, idx: NodeIndex, pool: &NodePool) {
        let total = pool.node(idx).total;
        while i > 0 {
            let parent = (i - 1) / 2;
            if pool.node(self.heap[parent]).total <= total {
                break;
            }
            self.heap[i] = self.heap[parent];
            i = parent;
        }
        self.heap[i] = idx;
    }

    fn trickle_down(&mut self, mut i: usize, idx: NodeIndex, pool: &NodePool) {
        let size = self.heap.len();
        let total = pool.node(idx).total;
        let mut child = i * 2 + 1;
        while child < size {
            if child + 1 < size
                && pool.node(self.heap[child]).total > pool.node(self.heap[child + 1]).total
            {
                child += 1;
            }
            if total <= pool.node(self.heap[child]).total {
                break;
            }
            self.heap[i] = self.heap[child];
            i = child;
            child = i * 2 + 1;
        }
        self.heap[i] = idx;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_pool() {
        let mut pool = NodePool::new(16, 8);

        let poly1 = PolyRef::new(1);
        let idx1 = pool.get_node(poly1, 0).unwrap();
        assert_eq!(pool.node(idx1).id, poly1);
        assert_eq!(pool.node(idx1).state, 0);
        assert_eq!(pool.find_node(poly1, 0), Some(idx1));
        assert_eq!(pool.get_node(poly1, 0), Some(idx1));

        let idx2 = pool.get_node(poly1, 1).unwrap();
        assert_ne!(idx1, idx2);
        assert_eq!(pool.find_nodes(poly1, 10).len(), 2);
        assert_eq!(pool.find_nodes(poly1, 1).len(), 1);
        assert_eq!(pool.node_count(), 2);
    }

    #[test]
    fn test_node_pool_exhaustion_and_clear() {
        let mut pool = NodePool::new(2, 4);
        assert!(pool.get_node(PolyRef::new(1), 0).is_some());
        assert!(pool.get_node(PolyRef::new(2), 0).is_some());
        assert!(pool.get_node(PolyRef::new(3), 0).is_none());
        // Existing nodes are still found when the pool is full.
        assert!(pool.get_node(PolyRef::new(2), 0).is_some());

        pool.clear();
        assert_eq!(pool.node_count(), 0);
        assert!(pool.find_node(PolyRef::new(1), 0).is_none());
        let idx = pool.get_node(PolyRef::new(3), 0).unwrap();
        assert_eq!(pool.node(idx).flags, NodeFlags::empty());
        assert!(pool.node(idx).shortcut.is_none());
    }

    #[test]
    fn test_parent_indices_are_one_based() {
        let mut pool = NodePool::new(4, 4);
        let a = pool.get_node(PolyRef::new(1), 0).unwrap();
        let b = pool.get_node(PolyRef::new(2), 0).unwrap();
        pool.node_mut(b).pidx = pool.get_node_idx(a);
        assert_eq!(pool.parent_of(b), Some(a));
        assert_eq!(pool.parent_of(a), None);
        assert_eq!(pool.get_node_at_idx(0), None);
    }

    #[test]
    fn test_node_queue() {
        let mut pool = NodePool::new(16, 8);
        let mut queue = NodeQueue::new(16);

        for (id, total) in [(1, 5.0), (2, 3.0), (3, 7.0), (4, 4.0)] {
            let idx = pool.get_node(PolyRef::new(id), 0).unwrap();
            pool.node_mut(idx).total = total;
            queue.push(idx, &pool);
        }

        // Lower the cost of node 3 below everything else.
        let idx3 = pool.find_node(PolyRef::new(3), 0).unwrap();
        pool.node_mut(idx3).total = 1.0;
        queue.modify(idx3, &pool);

        let order: Vec<u64> = std::iter::from_fn(|| queue.pop(&pool))
            .map(|idx| pool.node(idx).id.id())
            .collect();
        assert_eq!(order, vec![3, 2, 4, 1]);
        assert!(queue.is_empty());
    }
}
