use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{CachePolicy, EvictionListener};
use crate::buffer::CacheBuffer;

/// First-in-first-out eviction: buffers die in insertion order, regardless
/// of how often they are hit.
#[derive(Default)]
pub struct FifoPolicy {
    buffers: Mutex<VecDeque<Arc<CacheBuffer>>>,
}

impl FifoPolicy {
    /// Create an empty policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffers currently tracked.
    pub fn len(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Whether the policy tracks no buffers.
    pub fn is_empty(&self) -> bool {
        self.buffers.lock().is_empty()
    }
}

impl CachePolicy for FifoPolicy {
    fn cache(&self, buffer: &Arc<CacheBuffer>) {
        self.buffers.lock().push_back(buffer.clone());
    }

    fn notify_lock(&self, _buffer: &Arc<CacheBuffer>) {
        // FIFO does not reorder on access.
    }

    fn notify_unlock(&self, _buffer: &Arc<CacheBuffer>) {}

    fn evict_some_blocks(&self, target: u64, listener: &dyn EvictionListener) -> u64 {
        let mut evicted = 0u64;
        let mut victims = Vec::new();
        {
            let mut buffers = self.buffers.lock();
            let mut kept = VecDeque::with_capacity(buffers.len());
            while let Some(candidate) = buffers.pop_front() {
                if evicted >= target {
                    kept.push_back(candidate);
                    continue;
                }
                if candidate.invalidate() {
                    evicted += candidate.len() as u64;
                    victims.push(candidate);
                } else if !candidate.is_invalidated() {
                    // Pinned; leave it in place.
                    kept.push_back(candidate);
                }
                // Buffers someone else invalidated are simply dropped.
            }
            *buffers = kept;
        }
        // The listener takes index and arena locks; call it lock-free.
        for victim in victims {
            listener.notify_evicted(victim);
        }
        evicted
    }
}
