//! Eviction wired end to end: allocation shortfalls drive the policy, the
//! policy honors pins, and drained buffers leave the index and the arenas.

use std::sync::Arc;
use std::time::Duration;

use rstest::rstest;
use strata_cache::{
    ByteRange, CacheBuffer, CacheConfig, DataCache, FileId, PolicyKind, RangeChunk,
};
use strata_error::StrataError;

/// One 64-byte block of total capacity.
fn one_block_cache(policy: PolicyKind) -> Arc<DataCache> {
    DataCache::new(
        CacheConfig::builder()
            .min_alloc(64)
            .max_alloc(64)
            .arena_size(64)
            .total_size(64)
            .policy_kind(policy)
            .cleanup_interval(None)
            .build(),
    )
    .unwrap()
}

fn two_block_cache(policy: PolicyKind) -> Arc<DataCache> {
    DataCache::new(
        CacheConfig::builder()
            .min_alloc(64)
            .max_alloc(64)
            .arena_size(64)
            .total_size(128)
            .policy_kind(policy)
            .cleanup_interval(None)
            .build(),
    )
    .unwrap()
}

fn put_block(cache: &DataCache, file: FileId, begin: u64) -> Arc<CacheBuffer> {
    let buf = cache.create_unallocated();
    cache
        .allocator()
        .allocate_multiple(std::slice::from_ref(&buf), 64)
        .unwrap();
    let mut bufs = vec![buf.clone()];
    assert!(cache
        .put_file_data(file, &[ByteRange::new(begin, begin + 64)], &mut bufs, 0)
        .is_none());
    buf
}

fn probe(cache: &DataCache, file: FileId, begin: u64) -> Vec<RangeChunk> {
    let mut chunks = vec![RangeChunk::Gap(ByteRange::new(begin, begin + 64))];
    cache.get_file_data(file, &mut chunks, 0);
    chunks
}

#[rstest]
#[case::fifo(PolicyKind::Fifo)]
#[case::lru(PolicyKind::Lru)]
fn pinned_buffer_defeats_eviction_until_released(#[case] policy: PolicyKind) {
    let cache = one_block_cache(policy);
    let file = FileId(1);
    let buf = put_block(&cache, file, 0);
    // Pin it a second time, as a reader would.
    let hits = probe(&cache, file, 0);
    assert_eq!(buf.ref_count(), 2);

    // The only candidate is pinned: eviction yields nothing and the
    // allocation fails.
    let fresh = cache.create_unallocated();
    let err = cache
        .allocator()
        .allocate_multiple(std::slice::from_ref(&fresh), 64)
        .unwrap_err();
    assert!(matches!(err, StrataError::OutOfCapacity(_)));
    assert!(!buf.is_invalidated());

    // Drop both pins and retry: the policy reclaims the block.
    cache.release_chunks(&hits);
    cache.release_buffer(&buf);
    let fresh = cache.create_unallocated();
    cache
        .allocator()
        .allocate_multiple(std::slice::from_ref(&fresh), 64)
        .unwrap();
    assert!(buf.is_invalidated());
    assert!(probe(&cache, file, 0)[0].is_gap());
    assert_eq!(cache.metrics().eviction_count(), 1);
}

#[test]
fn fifo_evicts_in_insertion_order() {
    let cache = two_block_cache(PolicyKind::Fifo);
    let file = FileId(1);
    let first = put_block(&cache, file, 0);
    let second = put_block(&cache, file, 64);
    cache.release_buffer(&first);
    cache.release_buffer(&second);

    // Touch the first block; FIFO must ignore the access.
    cache.release_chunks(&{
        let hits = probe(&cache, file, 0);
        assert!(!hits[0].is_gap());
        hits
    });

    let fresh = cache.create_unallocated();
    cache
        .allocator()
        .allocate_multiple(std::slice::from_ref(&fresh), 64)
        .unwrap();
    assert!(first.is_invalidated());
    assert!(!second.is_invalidated());
    assert!(probe(&cache, file, 0)[0].is_gap());
    assert!(!probe(&cache, file, 64)[0].is_gap());
}

#[test]
fn lru_eviction_follows_recency() {
    let cache = two_block_cache(PolicyKind::Lru);
    let file = FileId(1);
    let first = put_block(&cache, file, 0);
    let second = put_block(&cache, file, 64);
    cache.release_buffer(&first);
    cache.release_buffer(&second);

    // Touch the first block: the second becomes the eviction candidate.
    let hits = probe(&cache, file, 0);
    cache.release_chunks(&hits);

    let fresh = cache.create_unallocated();
    cache
        .allocator()
        .allocate_multiple(std::slice::from_ref(&fresh), 64)
        .unwrap();
    assert!(!first.is_invalidated());
    assert!(second.is_invalidated());
}

#[test]
fn sweeper_drops_stale_entries() {
    let cache = DataCache::new(
        CacheConfig::builder()
            .min_alloc(64)
            .max_alloc(64)
            .arena_size(64)
            .total_size(128)
            .policy_kind(PolicyKind::Fifo)
            .cleanup_interval(Some(Duration::from_millis(5)))
            .build(),
    )
    .unwrap();
    let file = FileId(1);
    let buf = put_block(&cache, file, 0);
    cache.release_buffer(&buf);
    assert!(buf.invalidate());

    // The entry is stale, not gone; lookups already miss it, and the
    // sweeper collects it shortly.
    assert!(probe(&cache, file, 0)[0].is_gap());
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while cache.cached_range_count(file) > 0 {
        assert!(std::time::Instant::now() < deadline, "stale entry survived");
        std::thread::sleep(Duration::from_millis(5));
    }
}
