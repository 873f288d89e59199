use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crate::policy::{CachePolicy, EvictionListener};

/// How many eviction rounds a waiting reservation attempts before giving up.
const MAX_RESERVE_ATTEMPTS: usize = 8;

/// Global capacity accounting for the cache.
///
/// Arbitrates between the allocator's desire to grow and the policy's
/// obligation to evict: a reservation that would exceed the configured total
/// triggers [`CachePolicy::evict_some_blocks`] before it is allowed to fail.
pub struct MemoryManager {
    total_size: u64,
    used: AtomicU64,
    policy: Arc<dyn CachePolicy>,
    /// The eviction drain target, registered by the cache once it exists.
    /// Weak: the cache owns the manager, not the other way around.
    listener: OnceLock<Weak<dyn EvictionListener>>,
}

impl MemoryManager {
    /// Create a manager enforcing `total_size` outstanding allocated bytes.
    pub fn new(total_size: u64, policy: Arc<dyn CachePolicy>) -> Arc<Self> {
        Arc::new(Self {
            total_size,
            used: AtomicU64::new(0),
            policy,
            listener: OnceLock::new(),
        })
    }

    /// Register the component that drains evicted buffers out of the index
    /// and back into the allocator. Called once at wiring time.
    pub fn set_eviction_listener(&self, listener: Weak<dyn EvictionListener>) {
        if self.listener.set(listener).is_err() {
            log::warn!("eviction listener already registered; ignoring");
        }
    }

    /// Account for `size` fresh bytes. On shortfall, evicts; when
    /// `wait_for_eviction` is set, retries a bounded number of times, each
    /// after yielding to let concurrent releases land.
    pub fn reserve_memory(&self, size: u64, wait_for_eviction: bool) -> bool {
        let mut attempt = 0;
        loop {
            let mut used = self.used.load(Ordering::Relaxed);
            while used + size <= self.total_size {
                match self.used.compare_exchange_weak(
                    used,
                    used + size,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return true,
                    Err(actual) => used = actual,
                }
            }

            let shortfall = (used + size).saturating_sub(self.total_size);
            let evicted = self.evict(shortfall);
            attempt += 1;
            if attempt >= MAX_RESERVE_ATTEMPTS {
                log::warn!(
                    "failed to reserve {size} bytes after {attempt} attempts \
                     ({used} of {} in use)",
                    self.total_size
                );
                return false;
            }
            if evicted == 0 {
                if !wait_for_eviction {
                    return false;
                }
                std::thread::yield_now();
            }
        }
    }

    /// Ask the policy for `target` more bytes. Used by the allocator when
    /// capacity accounting succeeded but the arenas are too fragmented to
    /// carve the blocks.
    pub(crate) fn evict(&self, target: u64) -> u64 {
        let Some(listener) = self.listener.get().and_then(Weak::upgrade) else {
            return 0;
        };
        self.policy.evict_some_blocks(target, listener.as_ref())
    }

    /// Return `size` bytes to the budget.
    pub fn release_memory(&self, size: u64) {
        let prev = self.used.fetch_sub(size, Ordering::AcqRel);
        debug_assert!(prev >= size, "memory accounting underflow");
    }

    /// Outstanding allocated bytes.
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    /// The configured capacity.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }
}
