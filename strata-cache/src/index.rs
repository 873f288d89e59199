use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::buffer::{CacheBuffer, IndexKey};
use crate::metrics::CacheMetrics;
use crate::policy::CachePolicy;
use crate::range::{ByteRange, FileId, RangeChunk};

struct CacheEntry {
    end: u64,
    buffer: Arc<CacheBuffer>,
}

/// The cached ranges of a single file: an ordered map from start offset to
/// `(end, buffer)`. Entries cover disjoint intervals.
///
/// Lookups take the shared lock and pin buffers via the handle's CAS word;
/// mutation takes the exclusive lock. Stale entries (invalidated but not yet
/// removed) are never fatal: a failed pin is a miss.
pub(crate) struct FileRanges {
    file: FileId,
    map: RwLock<BTreeMap<u64, CacheEntry>>,
}

impl FileRanges {
    pub(crate) fn new(file: FileId) -> Self {
        Self {
            file,
            map: RwLock::new(BTreeMap::new()),
        }
    }

    /// Rewrite every [`RangeChunk::Gap`] in `chunks` into the interleaving
    /// of pinned hits and residual gaps that covers it. Non-gap chunks pass
    /// through untouched. Probe offsets are translated by `base_offset`;
    /// emitted chunks carry translated offsets.
    pub(crate) fn get_ranges(
        &self,
        chunks: &mut Vec<RangeChunk>,
        base_offset: u64,
        policy: &dyn CachePolicy,
        metrics: &CacheMetrics,
    ) {
        let mut out = Vec::with_capacity(chunks.len());
        for chunk in chunks.drain(..) {
            match chunk {
                RangeChunk::Gap(range) => {
                    self.weave(range.shifted(base_offset), &mut out, policy, metrics)
                }
                other => out.push(other),
            }
        }
        *chunks = out;
    }

    fn weave(
        &self,
        probe: ByteRange,
        out: &mut Vec<RangeChunk>,
        policy: &dyn CachePolicy,
        metrics: &CacheMetrics,
    ) {
        let map = self.map.read();

        // The entry containing the probe start may begin before it.
        let mut scan_from = probe.begin;
        if let Some((&start, entry)) = map.range(..=probe.begin).next_back() {
            if entry.end > probe.begin {
                scan_from = start;
            }
        }

        let mut pos = probe.begin;
        for (&start, entry) in map.range(scan_from..probe.end) {
            let hit_begin = pos.max(start);
            let hit_end = probe.end.min(entry.end);
            if hit_begin >= hit_end {
                continue;
            }
            if !entry.buffer.inc_ref() {
                // Invalidated but not yet swept: a miss.
                continue;
            }
            policy.notify_lock(&entry.buffer);
            metrics.hits.inc();
            if pos < hit_begin {
                metrics.misses.inc();
                out.push(RangeChunk::Gap(ByteRange::new(pos, hit_begin)));
            }
            out.push(RangeChunk::Cached {
                range: ByteRange::new(hit_begin, hit_end),
                buffer: entry.buffer.clone(),
            });
            pos = hit_end;
            if pos >= probe.end {
                break;
            }
        }
        if pos < probe.end {
            metrics.misses.inc();
            out.push(RangeChunk::Gap(ByteRange::new(pos, probe.end)));
        }
    }

    /// Insert `(range, buffer)` pairs, deduplicating against concurrent
    /// producers. Where a live entry already occupies a start offset, the
    /// caller's pointer is replaced with the winner (pinned once for the
    /// caller) and the corresponding bit is set in the returned mask; the
    /// caller must release its duplicate to the allocator. Stale entries are
    /// replaced silently.
    pub(crate) fn put_ranges(
        &self,
        ranges: &[ByteRange],
        buffers: &mut [Arc<CacheBuffer>],
        base_offset: u64,
        policy: &dyn CachePolicy,
        metrics: &CacheMetrics,
    ) -> Option<Vec<u64>> {
        debug_assert_eq!(ranges.len(), buffers.len());
        let mut mask: Option<Vec<u64>> = None;
        let words = ranges.len().div_ceil(64);

        let mut map = self.map.write();
        for (i, (range, slot)) in ranges.iter().zip(buffers.iter_mut()).enumerate() {
            let range = range.shifted(base_offset);
            match map.entry(range.begin) {
                Entry::Vacant(vacant) => {
                    self.admit(slot, range, policy, metrics);
                    vacant.insert(CacheEntry {
                        end: range.end,
                        buffer: slot.clone(),
                    });
                }
                Entry::Occupied(mut occupied) => {
                    let existing = occupied.get().buffer.clone();
                    if existing.inc_ref() {
                        // Live collision: the caller adopts the winner.
                        policy.notify_lock(&existing);
                        metrics.collisions.inc();
                        mask.get_or_insert_with(|| vec![0u64; words])[i / 64] |= 1 << (i % 64);
                        *slot = existing;
                    } else {
                        self.admit(slot, range, policy, metrics);
                        occupied.insert(CacheEntry {
                            end: range.end,
                            buffer: slot.clone(),
                        });
                    }
                }
            }
        }
        mask
    }

    fn admit(
        &self,
        buffer: &Arc<CacheBuffer>,
        range: ByteRange,
        policy: &dyn CachePolicy,
        metrics: &CacheMetrics,
    ) {
        let _ = buffer.index_key.set(IndexKey {
            file: self.file,
            start: range.begin,
        });
        buffer.mark_cached();
        policy.cache(buffer);
        metrics.stores.inc();
    }

    /// Drop every entry referencing `buffer`. Returns whether the map is now
    /// empty. The recorded publication key makes the common case a single
    /// tree lookup; a full scan covers a handle whose key was replaced.
    pub(crate) fn remove_buffer(&self, buffer: &Arc<CacheBuffer>) -> bool {
        let mut map = self.map.write();
        if let Some(key) = buffer.index_key.get() {
            if let Some(entry) = map.get(&key.start) {
                if Arc::ptr_eq(&entry.buffer, buffer) {
                    map.remove(&key.start);
                    return map.is_empty();
                }
            }
        }
        map.retain(|_, entry| !Arc::ptr_eq(&entry.buffer, buffer));
        map.is_empty()
    }

    /// Drop entries whose buffer has been invalidated. Returns the number
    /// removed and whether the map is now empty.
    pub(crate) fn sweep_stale(&self) -> (usize, bool) {
        let mut map = self.map.write();
        let before = map.len();
        map.retain(|_, entry| !entry.buffer.is_invalidated());
        (before - map.len(), map.is_empty())
    }

    /// Number of live entries, counting stale ones still awaiting a sweep.
    pub(crate) fn len(&self) -> usize {
        self.map.read().len()
    }
}
