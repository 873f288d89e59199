use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use strata_error::StrataResult;
use witchcraft_metrics::MetricRegistry;

use crate::alloc::BuddyAllocator;
use crate::buffer::CacheBuffer;
use crate::config::{CacheConfig, PolicyKind};
use crate::index::FileRanges;
use crate::memory::MemoryManager;
use crate::metrics::CacheMetrics;
use crate::policy::{CachePolicy, EvictionListener, FifoPolicy, LruPolicy};
use crate::range::{ByteRange, FileId, RangeChunk};

/// The data cache: a buddy allocator, a per-file cached-range index, and an
/// eviction policy, wired so that allocation shortfalls drive eviction and
/// eviction drains back through the index into the allocator.
///
/// All methods are safe to call from any number of threads. See
/// [`CacheConfig`] for sizing.
pub struct DataCache {
    files: DashMap<FileId, Arc<FileRanges>>,
    policy: Arc<dyn CachePolicy>,
    allocator: Arc<BuddyAllocator>,
    memory: Arc<MemoryManager>,
    metrics: CacheMetrics,
    stop: Arc<AtomicBool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl DataCache {
    /// Build a cache from `config`, with metrics going to a private
    /// registry. Fails on configuration violations.
    pub fn new(config: CacheConfig) -> StrataResult<Arc<Self>> {
        Self::with_metrics(config, &MetricRegistry::default())
    }

    /// Build a cache registering its metrics in `registry`.
    pub fn with_metrics(
        config: CacheConfig,
        registry: &MetricRegistry,
    ) -> StrataResult<Arc<Self>> {
        config.validate()?;
        let policy: Arc<dyn CachePolicy> = match config.policy_kind {
            PolicyKind::Fifo => Arc::new(FifoPolicy::new()),
            PolicyKind::Lru => Arc::new(LruPolicy::new()),
        };
        let memory = MemoryManager::new(config.total_size, policy.clone());
        let allocator = Arc::new(BuddyAllocator::new(&config, memory.clone())?);
        let cache = Arc::new(Self {
            files: DashMap::new(),
            policy,
            allocator,
            memory: memory.clone(),
            metrics: CacheMetrics::new(registry),
            stop: Arc::new(AtomicBool::new(false)),
            sweeper: Mutex::new(None),
        });
        let cache_as_listener: Arc<dyn EvictionListener> = cache.clone();
        let listener: Weak<dyn EvictionListener> = Arc::downgrade(&cache_as_listener);
        memory.set_eviction_listener(listener);
        if let Some(interval) = config.cleanup_interval {
            Self::spawn_sweeper(&cache, interval)?;
        }
        Ok(cache)
    }

    fn spawn_sweeper(cache: &Arc<Self>, interval: Duration) -> StrataResult<()> {
        let stop = cache.stop.clone();
        let weak = Arc::downgrade(cache);
        let handle = std::thread::Builder::new()
            .name("strata-cache-sweeper".into())
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    std::thread::park_timeout(interval);
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    let Some(cache) = weak.upgrade() else {
                        break;
                    };
                    cache.sweep();
                }
            })?;
        *cache.sweeper.lock() = Some(handle);
        Ok(())
    }

    /// Drop stale index entries and empty per-file maps. Runs periodically
    /// on the sweeper thread; exposed for deterministic tests.
    pub fn sweep(&self) {
        let mut swept_entries = 0usize;
        let mut swept_files = 0usize;
        let files: Vec<FileId> = self.files.iter().map(|entry| *entry.key()).collect();
        for file in files {
            let Some(ranges) = self.files.get(&file).map(|entry| entry.value().clone()) else {
                continue;
            };
            let (swept, empty) = ranges.sweep_stale();
            swept_entries += swept;
            drop(ranges);
            if empty {
                // Only drop the file map while nobody else holds it; an
                // in-flight producer keeps a clone and blocks the removal.
                let removed = self
                    .files
                    .remove_if(&file, |_, v| v.len() == 0 && Arc::strong_count(v) == 1);
                if removed.is_some() {
                    swept_files += 1;
                }
            }
        }
        if swept_entries > 0 || swept_files > 0 {
            log::debug!("swept {swept_entries} stale entries, {swept_files} idle files");
        }
    }

    /// Rewrite every gap in `chunks` into interleaved cache hits (pinned
    /// once per hit) and residual gaps. Chunks that already carry data pass
    /// through untouched. Probe offsets are translated by `base_offset`.
    pub fn get_file_data(&self, file: FileId, chunks: &mut Vec<RangeChunk>, base_offset: u64) {
        let Some(ranges) = self.files.get(&file).map(|entry| entry.value().clone()) else {
            for chunk in chunks.iter() {
                if chunk.is_gap() {
                    self.metrics.misses.inc();
                }
            }
            return;
        };
        ranges.get_ranges(chunks, base_offset, self.policy.as_ref(), &self.metrics);
    }

    /// Publish `(range, buffer)` pairs for `file`.
    ///
    /// Returns `None` when every buffer was admitted. Otherwise returns the
    /// conflict bitmask (bit `i` of word `i / 64`): for each set bit, a
    /// concurrent producer won the race, `buffers[i]` has been replaced with
    /// the winner (pinned once for this caller), and the caller must release
    /// its duplicate's memory to the allocator.
    pub fn put_file_data(
        &self,
        file: FileId,
        ranges: &[ByteRange],
        buffers: &mut [Arc<CacheBuffer>],
        base_offset: u64,
    ) -> Option<Vec<u64>> {
        let file_ranges = self
            .files
            .entry(file)
            .or_insert_with(|| Arc::new(FileRanges::new(file)))
            .clone();
        file_ranges.put_ranges(ranges, buffers, base_offset, self.policy.as_ref(), &self.metrics)
    }

    /// Release one pin and let the policy reorder.
    pub fn release_buffer(&self, buffer: &Arc<CacheBuffer>) {
        buffer.dec_ref();
        self.policy.notify_unlock(buffer);
    }

    /// Release the pins held by every cached chunk in `chunks`.
    pub fn release_chunks<'a>(&self, chunks: impl IntoIterator<Item = &'a RangeChunk>) {
        for chunk in chunks {
            if let Some(buffer) = chunk.as_cached() {
                self.release_buffer(buffer);
            }
        }
    }

    /// The allocator backing this cache.
    pub fn allocator(&self) -> &Arc<BuddyAllocator> {
        &self.allocator
    }

    /// A fresh unallocated buffer handle, for producers that need handle
    /// identity before decompression targets exist.
    pub fn create_unallocated(&self) -> Arc<CacheBuffer> {
        CacheBuffer::unallocated()
    }

    /// Cache metrics.
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Outstanding allocated bytes.
    pub fn used_bytes(&self) -> u64 {
        self.memory.used()
    }

    /// Number of index entries for `file`, stale entries included. Debug and
    /// test aid.
    pub fn cached_range_count(&self, file: FileId) -> usize {
        self.files
            .get(&file)
            .map(|entry| entry.value().len())
            .unwrap_or(0)
    }
}

impl EvictionListener for DataCache {
    /// Drain one invalidated buffer: drop its index entries and return the
    /// memory to the allocator. Called by the policy's eviction walk, and by
    /// tests that force an eviction.
    fn notify_evicted(&self, buffer: Arc<CacheBuffer>) {
        debug_assert!(buffer.is_invalidated());
        self.metrics.evictions.inc();
        if let Some(key) = buffer.index_key.get() {
            if let Some(ranges) = self.files.get(&key.file).map(|entry| entry.value().clone()) {
                ranges.remove_buffer(&buffer);
            }
        }
        self.allocator.deallocate(&buffer);
    }
}

impl Drop for DataCache {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.sweeper.lock().take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}
