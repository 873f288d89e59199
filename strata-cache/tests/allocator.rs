//! Allocation ladders and stress over the buddy allocator, with every
//! buffer's contents verified against a written pattern.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use strata_cache::{BuddyAllocator, CacheBuffer, CacheConfig, MemoryManager, PolicyKind};

fn allocator(min_log2: u32, max_log2: u32, arena_mult: usize, arena_count: usize) -> BuddyAllocator {
    let max_alloc = 1usize << max_log2;
    let arena_size = max_alloc * arena_mult;
    let config = CacheConfig::builder()
        .min_alloc(1 << min_log2)
        .max_alloc(max_alloc)
        .arena_size(arena_size)
        .total_size((arena_size * arena_count) as u64)
        .policy_kind(PolicyKind::Fifo)
        .build();
    let memory = MemoryManager::new(
        config.total_size,
        Arc::new(strata_cache::FifoPolicy::new()),
    );
    BuddyAllocator::new(&config, memory).unwrap()
}

fn pattern(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

fn allocate_patterned(a: &BuddyAllocator, count: usize, size: usize, seed: u64) -> Vec<Arc<CacheBuffer>> {
    let bufs: Vec<_> = (0..count).map(|_| a.create_unallocated()).collect();
    a.allocate_multiple(&bufs, size)
        .unwrap_or_else(|e| panic!("failed to allocate {count} of {size}: {e}; {}", a.debug_dump()));
    for (i, buf) in bufs.iter().enumerate() {
        assert!(buf.len() >= size);
        // SAFETY: freshly allocated and unpublished; this test thread is the
        // sole producer.
        unsafe { buf.write_all(&pattern(seed + i as u64, buf.len())) };
    }
    bufs
}

fn verify_and_free(a: &BuddyAllocator, bufs: Vec<Arc<CacheBuffer>>, seed: u64) {
    for (i, buf) in bufs.iter().enumerate() {
        assert_eq!(buf.as_slice(), &pattern(seed + i as u64, buf.len())[..]);
        a.deallocate(buf);
    }
}

/// One batch per size, ascending, then freed in the requested order.
fn allocate_up(a: &BuddyAllocator, min: u32, max: u32, per_size: usize, same_order_free: bool) {
    let mut batches = Vec::new();
    for (seed, log2) in (min..=max).enumerate() {
        // Sizes just under the power of two exercise rounding.
        batches.push(allocate_patterned(a, per_size, (1 << log2) - 1, seed as u64 * 100));
    }
    free_batches(a, batches, same_order_free);
}

fn allocate_down(a: &BuddyAllocator, min: u32, max: u32, per_size: usize, same_order_free: bool) {
    let mut batches = Vec::new();
    for (seed, log2) in (min..=max).rev().enumerate() {
        batches.push(allocate_patterned(a, per_size, (1 << log2) - 1, seed as u64 * 100));
    }
    free_batches(a, batches, same_order_free);
}

fn free_batches(a: &BuddyAllocator, batches: Vec<Vec<Arc<CacheBuffer>>>, same_order: bool) {
    let seeds: Vec<u64> = (0..batches.len()).map(|i| i as u64 * 100).collect();
    if same_order {
        for (batch, seed) in batches.into_iter().zip(seeds) {
            verify_and_free(a, batch, seed);
        }
    } else {
        for (batch, seed) in batches.into_iter().zip(seeds).rev() {
            verify_and_free(a, batch, seed);
        }
    }
}

fn alloc_same_size(a: &BuddyAllocator, count: usize, size_log2: u32) {
    let mut batches = Vec::new();
    for j in 0..count {
        batches.push(allocate_patterned(a, 1, 1 << size_log2, j as u64 * 100));
    }
    free_batches(a, batches, false);
}

#[test]
fn variable_size_allocs() {
    let a = allocator(3, 8, 2, 1);
    allocate_up(&a, 3, 8, 1, true);
    allocate_down(&a, 3, 8, 1, true);
    allocate_down(&a, 3, 8, 1, false);
    allocate_up(&a, 3, 8, 1, false);
}

#[test]
fn variable_size_multi_allocs() {
    for (count, arenas) in [(3usize, 3usize), (5, 5)] {
        let a = allocator(3, 8, 2, arenas);
        allocate_up(&a, 3, 8, count, true);
        allocate_down(&a, 3, 8, count, true);
        allocate_down(&a, 3, 8, count, false);
        allocate_up(&a, 3, 8, count, false);
    }
}

#[test]
fn same_sizes() {
    let a = allocator(3, 8, 1, 1);
    for log2 in 3..=8 {
        alloc_same_size(&a, 1 << (8 - log2), log2);
    }
}

#[test]
fn multiple_arenas() {
    let a = allocator(3, 8, 1, 5);
    alloc_same_size(&a, 10, 7);
}

#[test]
fn full_deallocation_restores_every_arena() {
    let a = allocator(3, 8, 2, 3);
    let bufs = allocate_patterned(&a, 3 * 2 * 32, 8, 7);
    for buf in bufs.iter().rev() {
        a.deallocate(buf);
    }
    for counts in a.free_block_counts() {
        let (top, rest) = counts.split_last().unwrap();
        assert_eq!(*top, 2, "{}", a.debug_dump());
        assert!(rest.iter().all(|&n| n == 0), "{}", a.debug_dump());
    }
}

#[test]
fn concurrent_mixed_ladders() {
    let a = Arc::new(allocator(3, 8, 8, 3));
    let up = {
        let a = a.clone();
        std::thread::spawn(move || {
            allocate_up(&a, 3, 8, 3, false);
            allocate_up(&a, 3, 8, 3, true);
        })
    };
    let down = {
        let a = a.clone();
        std::thread::spawn(move || {
            allocate_down(&a, 3, 8, 3, false);
            allocate_down(&a, 3, 8, 3, true);
        })
    };
    let same = {
        let a = a.clone();
        std::thread::spawn(move || {
            for log2 in 3..=8 {
                alloc_same_size(&a, ((1usize << (8 - log2)) * 3).max(1), log2);
            }
        })
    };
    up.join().unwrap();
    down.join().unwrap();
    same.join().unwrap();
}
