#![deny(missing_docs)]

//! The low-level data cache of a columnar analytical query engine.
//!
//! The cache sits between on-disk columnar files and the decode path,
//! indexing decompressed compression blocks by `(file, byte range)` so that
//! repeated scans and overlapping row groups avoid re-reading storage. It is
//! built from three tightly coupled pieces:
//!
//! * [`BuddyAllocator`] carves pre-reserved arenas into power-of-two blocks
//!   with per-order free lists and coalescing on free;
//! * [`DataCache`] keeps a per-file ordered map of cached byte ranges and
//!   answers interval probes with interleaved hits and gaps;
//! * [`CachePolicy`] implementations ([`FifoPolicy`], [`LruPolicy`]) decide
//!   which cold buffer dies when a fresh allocation needs room.
//!
//! Buffers are shared through [`CacheBuffer`] handles whose single atomic
//! state word makes pinning and invalidation race deterministically: a
//! buffer with a positive refcount can never be evicted, and an invalidated
//! buffer can never be pinned.
//!
//! ```
//! use strata_cache::{ByteRange, CacheConfig, DataCache, FileId, RangeChunk};
//!
//! let cache = DataCache::new(
//!     CacheConfig::builder()
//!         .min_alloc(8)
//!         .max_alloc(1024)
//!         .arena_size(1024)
//!         .total_size(4096)
//!         .build(),
//! )?;
//!
//! // Nothing cached yet: the probe comes back as one gap.
//! let mut chunks = vec![RangeChunk::Gap(ByteRange::new(0, 1024))];
//! cache.get_file_data(FileId(7), &mut chunks, 0);
//! assert!(chunks[0].is_gap());
//! # Ok::<(), strata_error::StrataError>(())
//! ```

mod alloc;
mod buffer;
mod cache;
mod config;
mod index;
mod memory;
mod metrics;
mod policy;
mod range;

pub use alloc::BuddyAllocator;
pub use buffer::CacheBuffer;
pub use cache::DataCache;
pub use config::{CacheConfig, CacheConfigBuilder, PolicyKind};
pub use memory::MemoryManager;
pub use metrics::CacheMetrics;
pub use policy::{CachePolicy, EvictionListener, FifoPolicy, LruPolicy};
pub use range::{ByteRange, FileId, RangeChunk};
