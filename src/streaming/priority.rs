//! Priority queues and work FIFOs for node streaming
//!
//! Priorities are projected on-screen sizes. The load queue hands out the
//! largest first; the eviction queue hands out the smallest first, so its
//! head is always the loaded node the viewer would miss least.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use crate::streaming::node::{NodeId, OctreeNode};

/// A node with its projected size at the time it was queued
#[derive(Clone, Debug)]
pub struct Prioritized {
    pub priority: f32,
    seq: u64,
    pub node: Arc<OctreeNode>,
}

impl Eq for Prioritized {}

impl PartialEq for Prioritized {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Ord for Prioritized {
    fn cmp(&self, other: &Self) -> Ordering {
        // Larger priority first; equal priorities in insertion order
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Prioritized {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Nodes waiting to be loaded, most urgent (largest projected size) first
#[derive(Debug, Default)]
pub struct LoadQueue {
    heap: BinaryHeap<Prioritized>,
    next_seq: u64,
}

impl LoadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, node: Arc<OctreeNode>, priority: f32) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Prioritized { priority, seq, node });
    }

    /// Remove the most urgent node
    pub fn pop(&mut self) -> Option<Prioritized> {
        self.heap.pop()
    }

    pub fn peek(&self) -> Option<&Prioritized> {
        self.heap.peek()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    /// Contents in pop order
    pub fn snapshot(&self) -> Vec<(NodeId, f32)> {
        let mut entries: Vec<_> = self.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|e| (e.node.id().clone(), e.priority)).collect()
    }
}

/// Loaded nodes as eviction candidates, least urgent (smallest projected size) first
#[derive(Debug, Default)]
pub struct EvictionQueue {
    heap: BinaryHeap<Reverse<Prioritized>>,
    next_seq: u64,
}

impl EvictionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, node: Arc<OctreeNode>, priority: f32) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Prioritized { priority, seq, node }));
    }

    /// Remove the least urgent node
    pub fn pop(&mut self) -> Option<Prioritized> {
        self.heap.pop().map(|Reverse(entry)| entry)
    }

    pub fn peek(&self) -> Option<&Prioritized> {
        self.heap.peek().map(|Reverse(entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Contents in pop order
    pub fn snapshot(&self) -> Vec<(NodeId, f32)> {
        let mut entries: Vec<_> = self.heap.iter().map(|Reverse(e)| e).collect();
        entries.sort();
        entries.into_iter().map(|e| (e.node.id().clone(), e.priority)).collect()
    }
}

/// Thread-safe FIFO of nodes handed from the loader to the consumer.
///
/// Its lock is a leaf: never held while acquiring another lock.
#[derive(Debug, Default)]
pub struct WorkFifo {
    queue: Mutex<VecDeque<Arc<OctreeNode>>>,
}

impl WorkFifo {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Arc<OctreeNode>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, node: Arc<OctreeNode>) {
        self.lock().push_back(node);
    }

    pub fn pop(&self) -> Option<Arc<OctreeNode>> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Ids of the queued nodes, front first
    pub fn ids(&self) -> Vec<NodeId> {
        self.lock().iter().map(|n| n.id().clone()).collect()
    }
}
