use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use strata_error::{strata_bail, StrataExpect, StrataResult};

use crate::buffer::{CacheBuffer, Location};
use crate::config::CacheConfig;
use crate::memory::MemoryManager;

/// Rounds the allocator is willing to alternate between carving and asking
/// the policy for more space before reporting the request unsatisfiable.
const MAX_EVICTION_ROUNDS: usize = 8;

/// A free-list link that points nowhere.
const NIL: i32 = -1;

/// Header value for a leaf that is not the head of any block.
const NOT_HEAD: u8 = 0xFF;

fn header(order: u32, free: bool) -> u8 {
    ((order as u8) << 1) | (free as u8)
}

/// The backing bytes of one arena, shared by the allocator and every live
/// buffer handle carved from it.
///
/// Synchronization of the contents is by protocol, not by lock: the header
/// table (under the arena mutex) ensures two live blocks never overlap, a
/// producing writer has the block to itself until it publishes the buffer,
/// and readers only look after pinning. See [`CacheBuffer::as_mut_slice`].
pub(crate) struct ArenaRegion {
    bytes: UnsafeCell<Box<[u8]>>,
}

// SAFETY: all access to the region goes through raw pointers scoped to
// disjoint blocks; the allocator never hands the same block to two owners.
unsafe impl Send for ArenaRegion {}
// SAFETY: as above.
unsafe impl Sync for ArenaRegion {}

impl ArenaRegion {
    fn new(size: usize) -> Self {
        Self {
            bytes: UnsafeCell::new(vec![0u8; size].into_boxed_slice()),
        }
    }

    pub(crate) fn base(&self) -> *mut u8 {
        // SAFETY: only the pointer escapes; no reference to the box is
        // retained across the call.
        unsafe { (*self.bytes.get()).as_mut_ptr() }
    }
}

/// Free lists and block headers of one arena. One byte per minimum-sized
/// leaf: either `NOT_HEAD`, or the order of the block starting there plus a
/// free bit. Links are kept in side arrays indexed by leaf.
struct ArenaInner {
    headers: Box<[u8]>,
    free_heads: Box<[i32]>,
    next: Box<[i32]>,
    prev: Box<[i32]>,
}

impl ArenaInner {
    fn new(leaves: usize, max_order: u32) -> Self {
        let mut inner = Self {
            headers: vec![NOT_HEAD; leaves].into_boxed_slice(),
            free_heads: vec![NIL; max_order as usize + 1].into_boxed_slice(),
            next: vec![NIL; leaves].into_boxed_slice(),
            prev: vec![NIL; leaves].into_boxed_slice(),
        };
        // The arena starts as a row of free blocks of the largest
        // allocatable order.
        let step = 1usize << max_order;
        let mut leaf = 0;
        while leaf < leaves {
            inner.push_free(leaf, max_order);
            leaf += step;
        }
        inner
    }

    fn push_free(&mut self, leaf: usize, order: u32) {
        let head = self.free_heads[order as usize];
        self.next[leaf] = head;
        self.prev[leaf] = NIL;
        if head != NIL {
            self.prev[head as usize] = leaf as i32;
        }
        self.free_heads[order as usize] = leaf as i32;
        self.headers[leaf] = header(order, true);
    }

    fn pop_free(&mut self, order: u32) -> Option<usize> {
        let head = self.free_heads[order as usize];
        if head == NIL {
            return None;
        }
        let leaf = head as usize;
        let next = self.next[leaf];
        self.free_heads[order as usize] = next;
        if next != NIL {
            self.prev[next as usize] = NIL;
        }
        self.headers[leaf] = header(order, false);
        Some(leaf)
    }

    fn unlink(&mut self, leaf: usize, order: u32) {
        let prev = self.prev[leaf];
        let next = self.next[leaf];
        if prev == NIL {
            self.free_heads[order as usize] = next;
        } else {
            self.next[prev as usize] = next;
        }
        if next != NIL {
            self.prev[next as usize] = prev;
        }
    }

    /// Pop a block of `order`, splitting the smallest larger free block when
    /// the exact order's list is empty.
    fn allocate_block(&mut self, order: u32, max_order: u32) -> Option<usize> {
        if let Some(leaf) = self.pop_free(order) {
            return Some(leaf);
        }
        for larger in order + 1..=max_order {
            let Some(leaf) = self.pop_free(larger) else {
                continue;
            };
            // Split down, freeing the upper buddy at every level.
            let mut current = larger;
            while current > order {
                current -= 1;
                self.push_free(leaf + (1usize << current), current);
            }
            self.headers[leaf] = header(order, false);
            return Some(leaf);
        }
        None
    }

    /// Mark a block free and coalesce with its buddy as far as `max_order`.
    fn free_block(&mut self, mut leaf: usize, mut order: u32, max_order: u32) {
        while order < max_order {
            let buddy = leaf ^ (1usize << order);
            if self.headers[buddy] != header(order, true) {
                break;
            }
            self.unlink(buddy, order);
            // The lower half heads the merged block.
            let (head, tail) = if buddy < leaf { (buddy, leaf) } else { (leaf, buddy) };
            self.headers[tail] = NOT_HEAD;
            leaf = head;
            order += 1;
        }
        self.push_free(leaf, order);
    }

    fn free_counts(&self, max_order: u32) -> Vec<usize> {
        (0..=max_order)
            .map(|order| {
                let mut count = 0;
                let mut cursor = self.free_heads[order as usize];
                while cursor != NIL {
                    count += 1;
                    cursor = self.next[cursor as usize];
                }
                count
            })
            .collect()
    }
}

struct Arena {
    index: u32,
    region: Arc<ArenaRegion>,
    inner: Mutex<ArenaInner>,
}

impl Arena {
    fn new(index: u32, arena_size: usize, min_log2: u32, max_order: u32) -> Self {
        let leaves = arena_size >> min_log2;
        Self {
            index,
            region: Arc::new(ArenaRegion::new(arena_size)),
            inner: Mutex::new(ArenaInner::new(leaves, max_order)),
        }
    }

    /// Back as many of `dest`'s handles as this arena can manage at `order`.
    fn allocate_into(
        &self,
        dest: &[Arc<CacheBuffer>],
        order: u32,
        min_log2: u32,
        max_order: u32,
    ) -> usize {
        let mut inner = self.inner.lock();
        for (filled, buffer) in dest.iter().enumerate() {
            let Some(leaf) = inner.allocate_block(order, max_order) else {
                return filled;
            };
            buffer.assign(Location {
                arena_index: self.index,
                offset: (leaf << min_log2) as u32,
                len: 1u32 << (min_log2 + order),
                region: self.region.clone(),
            });
        }
        dest.len()
    }

    fn free(&self, offset: usize, len: usize, min_log2: u32, max_order: u32) {
        let leaf = offset >> min_log2;
        let order = len.trailing_zeros() - min_log2;
        self.inner.lock().free_block(leaf, order, max_order);
    }
}

/// Carves pre-reserved arenas into power-of-two blocks via per-order free
/// lists, one bitmap-style header per minimum-sized leaf.
///
/// Arenas are created lazily up to `total_size / arena_size`; each has its
/// own lock, so allocations proceed in parallel across arenas. When no arena
/// can satisfy a request, the allocator asks the [`MemoryManager`] to evict
/// and retries a bounded number of rounds.
pub struct BuddyAllocator {
    min_alloc: usize,
    max_alloc: usize,
    arena_size: usize,
    min_log2: u32,
    /// Order of `max_alloc` relative to `min_alloc`.
    max_order: u32,
    max_arenas: usize,
    arenas: RwLock<Vec<Arc<Arena>>>,
    arena_hint: AtomicUsize,
    memory: Arc<MemoryManager>,
}

impl BuddyAllocator {
    /// Build an allocator from a validated configuration.
    pub fn new(config: &CacheConfig, memory: Arc<MemoryManager>) -> StrataResult<Self> {
        config.validate()?;
        let min_log2 = config.min_alloc.trailing_zeros();
        let max_order = config.max_alloc.trailing_zeros() - min_log2;
        let max_arenas = (config.total_size / config.arena_size as u64) as usize;
        let first = Arena::new(0, config.arena_size, min_log2, max_order);
        Ok(Self {
            min_alloc: config.min_alloc,
            max_alloc: config.max_alloc,
            arena_size: config.arena_size,
            min_log2,
            max_order,
            max_arenas,
            arenas: RwLock::new(vec![Arc::new(first)]),
            arena_hint: AtomicUsize::new(0),
            memory,
        })
    }

    /// The smallest allocatable block size.
    pub fn min_alloc(&self) -> usize {
        self.min_alloc
    }

    /// The largest allocatable block size.
    pub fn max_alloc(&self) -> usize {
        self.max_alloc
    }

    /// A placeholder handle bound to no arena, to be backed by a later
    /// [`Self::allocate_multiple`] call.
    pub fn create_unallocated(&self) -> Arc<CacheBuffer> {
        CacheBuffer::unallocated()
    }

    fn order_for(&self, size: usize) -> u32 {
        let size = size.max(self.min_alloc).next_power_of_two();
        size.trailing_zeros() - self.min_log2
    }

    /// Back every handle in `dest` with a block of at least `size` bytes
    /// (rounded up to the next power of two).
    ///
    /// Handles must be fresh [`CacheBuffer::unallocated`] placeholders. On
    /// failure, handles backed so far keep their memory; the caller's
    /// cleanup path returns them via [`Self::deallocate`].
    pub fn allocate_multiple(&self, dest: &[Arc<CacheBuffer>], size: usize) -> StrataResult<()> {
        if dest.is_empty() {
            return Ok(());
        }
        if size == 0 {
            strata_bail!(InvalidArgument: "cannot allocate empty blocks");
        }
        if size > self.max_alloc {
            // Too large for any arena; eviction cannot help.
            strata_bail!(
                OutOfCapacity: "allocation of {} bytes exceeds the maximum block size {}",
                size,
                self.max_alloc
            );
        }
        let order = self.order_for(size);
        let block = self.min_alloc << order;

        if !self
            .memory
            .reserve_memory((block * dest.len()) as u64, true)
        {
            strata_bail!(
                OutOfCapacity: "cannot reserve {} bytes for {} blocks",
                block * dest.len(),
                dest.len()
            );
        }

        let mut filled = 0;
        let mut rounds = 0;
        loop {
            filled += self.fill(&dest[filled..], order);
            if filled == dest.len() {
                return Ok(());
            }
            if self.try_add_arena() {
                continue;
            }
            // Capacity is accounted for but the arenas are fragmented or
            // crowded; ask the policy directly for the missing bytes.
            let missing = (dest.len() - filled) as u64 * block as u64;
            rounds += 1;
            if rounds >= MAX_EVICTION_ROUNDS {
                break;
            }
            if self.memory.evict(missing) == 0 {
                std::thread::yield_now();
            }
        }

        self.memory
            .release_memory((dest.len() - filled) as u64 * block as u64);
        log::warn!(
            "allocation failed after {rounds} eviction rounds: {filled} of {} blocks of {block} bytes; {}",
            dest.len(),
            self.debug_dump()
        );
        strata_bail!(
            OutOfCapacity: "allocated {} of {} blocks of {} bytes",
            filled,
            dest.len(),
            block
        )
    }

    fn fill(&self, dest: &[Arc<CacheBuffer>], order: u32) -> usize {
        if dest.is_empty() {
            return 0;
        }
        let arenas = self.arenas.read();
        let count = arenas.len();
        let start = self.arena_hint.fetch_add(1, Ordering::Relaxed) % count;
        let mut filled = 0;
        for i in 0..count {
            let arena = &arenas[(start + i) % count];
            filled += arena.allocate_into(&dest[filled..], order, self.min_log2, self.max_order);
            if filled == dest.len() {
                break;
            }
        }
        filled
    }

    fn try_add_arena(&self) -> bool {
        let mut arenas = self.arenas.write();
        if arenas.len() >= self.max_arenas {
            return false;
        }
        let index = arenas.len() as u32;
        arenas.push(Arc::new(Arena::new(
            index,
            self.arena_size,
            self.min_log2,
            self.max_order,
        )));
        log::debug!("created arena {} of {}", index + 1, self.max_arenas);
        true
    }

    /// Return a block to its arena, coalescing with free buddies, and hand
    /// the bytes back to the memory manager. Must be called exactly once per
    /// backed handle; unallocated placeholders are ignored.
    pub fn deallocate(&self, buffer: &CacheBuffer) {
        let Some(loc) = buffer.location() else {
            return;
        };
        {
            let arenas = self.arenas.read();
            let arena = arenas
                .get(loc.arena_index as usize)
                .strata_expect("buffer names an arena this allocator never created");
            arena.free(
                loc.offset as usize,
                loc.len as usize,
                self.min_log2,
                self.max_order,
            );
        }
        self.memory.release_memory(loc.len as u64);
    }

    /// Free-block counts per arena, indexed by order. Test and debug aid.
    pub fn free_block_counts(&self) -> Vec<Vec<usize>> {
        self.arenas
            .read()
            .iter()
            .map(|arena| arena.inner.lock().free_counts(self.max_order))
            .collect()
    }

    /// Human-readable summary of every arena's free lists.
    pub fn debug_dump(&self) -> String {
        self.free_block_counts()
            .iter()
            .enumerate()
            .map(|(i, counts)| {
                format!(
                    "arena {i}: [{}]",
                    counts
                        .iter()
                        .enumerate()
                        .map(|(order, n)| format!("{}x{}", n, self.min_alloc << order))
                        .join(", ")
                )
            })
            .join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::FifoPolicy;
    use crate::PolicyKind;

    fn allocator(min: usize, max: usize, arena: usize, total: u64) -> BuddyAllocator {
        let config = CacheConfig::builder()
            .min_alloc(min)
            .max_alloc(max)
            .arena_size(arena)
            .total_size(total)
            .policy_kind(PolicyKind::Fifo)
            .build();
        let memory = MemoryManager::new(total, Arc::new(FifoPolicy::new()));
        BuddyAllocator::new(&config, memory).unwrap()
    }

    fn alloc_n(a: &BuddyAllocator, n: usize, size: usize) -> Vec<Arc<CacheBuffer>> {
        let bufs: Vec<_> = (0..n).map(|_| CacheBuffer::unallocated()).collect();
        a.allocate_multiple(&bufs, size).unwrap();
        bufs
    }

    #[test]
    fn coalesces_back_to_max_order() {
        let a = allocator(8, 256, 256, 256);
        let bufs = alloc_n(&a, 32, 8);
        for buf in bufs.iter().rev() {
            a.deallocate(buf);
        }
        // Fully coalesced: one max-order block, nothing below.
        let counts = a.free_block_counts();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0], vec![0, 0, 0, 0, 0, 1]);
        let big = alloc_n(&a, 1, 256);
        assert_eq!(big[0].len(), 256);
    }

    #[test]
    fn min_and_max_sizes_allocate_on_fresh_cache() {
        let a = allocator(8, 256, 512, 1024);
        let small = alloc_n(&a, 1, 8);
        assert_eq!(small[0].len(), 8);
        let large = alloc_n(&a, 1, 256);
        assert_eq!(large[0].len(), 256);
    }

    #[test]
    fn oversized_request_fails_before_eviction() {
        let a = allocator(8, 256, 512, 1024);
        let bufs = vec![CacheBuffer::unallocated()];
        let err = a.allocate_multiple(&bufs, 257).unwrap_err();
        assert!(matches!(
            err,
            strata_error::StrataError::OutOfCapacity(_)
        ));
        assert_eq!(a.memory_used(), 0);
    }

    #[test]
    fn sizes_round_up_to_powers_of_two() {
        let a = allocator(8, 256, 512, 1024);
        let bufs = alloc_n(&a, 1, 100);
        assert_eq!(bufs[0].len(), 128);
        let bufs = alloc_n(&a, 1, 3);
        assert_eq!(bufs[0].len(), 8);
    }

    #[test]
    fn grows_arenas_lazily() {
        let a = allocator(8, 256, 256, 1280);
        // Five arenas' worth of max-order blocks.
        let bufs = alloc_n(&a, 5, 256);
        assert_eq!(a.free_block_counts().len(), 5);
        for buf in &bufs {
            a.deallocate(buf);
        }
    }

    #[test]
    fn split_and_refill_mixed_orders() {
        let a = allocator(8, 64, 256, 256);
        let small = alloc_n(&a, 4, 8);
        let mid = alloc_n(&a, 2, 32);
        let large = alloc_n(&a, 2, 64);
        for buf in small.iter().chain(mid.iter()).chain(large.iter()) {
            a.deallocate(buf);
        }
        let counts = a.free_block_counts();
        assert_eq!(counts[0][3], 4, "{}", a.debug_dump());
    }

    impl BuddyAllocator {
        fn memory_used(&self) -> u64 {
            self.memory.used()
        }
    }
}
