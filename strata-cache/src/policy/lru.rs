use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use strata_error::StrataExpect;

use super::{CachePolicy, EvictionListener};
use crate::buffer::{CacheBuffer, NO_POLICY_SLOT};

const NO_NODE: usize = usize::MAX;

struct Node {
    prev: usize,
    next: usize,
    buffer: Option<Arc<CacheBuffer>>,
}

/// Doubly linked list over a slab of nodes. The node id is embedded in the
/// buffer handle (`policy_slot`), giving O(1) unlink and move-to-tail
/// without a lookup table.
struct LruList {
    nodes: Vec<Node>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl LruList {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: NO_NODE,
            tail: NO_NODE,
        }
    }

    fn append(&mut self, buffer: Arc<CacheBuffer>) -> usize {
        let node = Node {
            prev: self.tail,
            next: NO_NODE,
            buffer: Some(buffer),
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        if self.tail != NO_NODE {
            self.nodes[self.tail].next = idx;
        } else {
            self.head = idx;
        }
        self.tail = idx;
        idx
    }

    fn unlink(&mut self, idx: usize) -> Option<Arc<CacheBuffer>> {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev != NO_NODE {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NO_NODE {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
        self.nodes[idx].prev = NO_NODE;
        self.nodes[idx].next = NO_NODE;
        let buffer = self.nodes[idx].buffer.take();
        self.free.push(idx);
        buffer
    }
}

/// Least-recently-used eviction with O(1) reordering.
///
/// Every unpin moves the buffer to the tail; every pin detaches it into an
/// implicit hot set, so a burst of pins on the same buffer does not churn
/// the list. Eviction walks from the head.
pub struct LruPolicy {
    list: Mutex<LruList>,
}

impl Default for LruPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl LruPolicy {
    /// Create an empty policy.
    pub fn new() -> Self {
        Self {
            list: Mutex::new(LruList::new()),
        }
    }

    /// Number of buffers currently on the eviction list. Buffers detached by
    /// an outstanding pin are not counted.
    pub fn len(&self) -> usize {
        let list = self.list.lock();
        list.nodes.len() - list.free.len()
    }

    /// Whether the eviction list is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(buffer: &CacheBuffer) -> Option<usize> {
        match buffer.policy_slot.load(Ordering::Relaxed) {
            NO_POLICY_SLOT => None,
            idx => Some(idx),
        }
    }
}

impl CachePolicy for LruPolicy {
    fn cache(&self, buffer: &Arc<CacheBuffer>) {
        let mut list = self.list.lock();
        let idx = list.append(buffer.clone());
        buffer.policy_slot.store(idx, Ordering::Relaxed);
    }

    fn notify_lock(&self, buffer: &Arc<CacheBuffer>) {
        let mut list = self.list.lock();
        if let Some(idx) = Self::slot(buffer) {
            list.unlink(idx);
            buffer.policy_slot.store(NO_POLICY_SLOT, Ordering::Relaxed);
        }
    }

    fn notify_unlock(&self, buffer: &Arc<CacheBuffer>) {
        let mut list = self.list.lock();
        if buffer.is_invalidated() || !buffer.is_cached() {
            if let Some(idx) = Self::slot(buffer) {
                list.unlink(idx);
                buffer.policy_slot.store(NO_POLICY_SLOT, Ordering::Relaxed);
            }
            return;
        }
        if let Some(idx) = Self::slot(buffer) {
            list.unlink(idx);
        }
        let idx = list.append(buffer.clone());
        buffer.policy_slot.store(idx, Ordering::Relaxed);
    }

    fn evict_some_blocks(&self, target: u64, listener: &dyn EvictionListener) -> u64 {
        let mut evicted = 0u64;
        let mut victims = Vec::new();
        {
            let mut list = self.list.lock();
            let mut cursor = list.head;
            while cursor != NO_NODE && evicted < target {
                let next = list.nodes[cursor].next;
                let mut killed = false;
                let dead = {
                    let buffer = list.nodes[cursor]
                        .buffer
                        .as_ref()
                        .strata_expect("linked node has a buffer");
                    if buffer.invalidate() {
                        evicted += buffer.len() as u64;
                        killed = true;
                        true
                    } else {
                        // Already invalidated elsewhere: drop the node.
                        // Pinned: skip.
                        buffer.is_invalidated()
                    }
                };
                if dead {
                    if let Some(buffer) = list.unlink(cursor) {
                        buffer.policy_slot.store(NO_POLICY_SLOT, Ordering::Relaxed);
                        if killed {
                            victims.push(buffer);
                        }
                    }
                }
                cursor = next;
            }
        }
        for victim in victims {
            listener.notify_evicted(victim);
        }
        evicted
    }
}
