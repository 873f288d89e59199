use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use static_assertions::const_assert_eq;
use strata_error::{strata_panic, StrataExpect};

use crate::alloc::ArenaRegion;
use crate::range::FileId;

/// Refcount occupies the low 32 bits of the state word.
const REFCOUNT_MASK: u64 = u32::MAX as u64;
/// Set once the buffer has been registered with the cached-range index.
const FLAG_CACHED: u64 = 1 << 62;
/// One-way sentinel: the buffer is dead and must never be pinned again.
const FLAG_INVALIDATED: u64 = 1 << 63;

const_assert_eq!(FLAG_CACHED & REFCOUNT_MASK, 0);
const_assert_eq!(FLAG_INVALIDATED & REFCOUNT_MASK, 0);
const_assert_eq!(FLAG_CACHED & FLAG_INVALIDATED, 0);

/// Slot sentinel meaning "not on any policy list".
pub(crate) const NO_POLICY_SLOT: usize = usize::MAX;

/// The physical slice a buffer occupies inside an arena. Assigned exactly
/// once, when the allocator backs the handle.
pub(crate) struct Location {
    pub(crate) arena_index: u32,
    pub(crate) offset: u32,
    pub(crate) len: u32,
    pub(crate) region: Arc<ArenaRegion>,
}

/// Where the cached-range index filed this buffer, recorded at publication so
/// eviction can remove the entry without scanning every file.
pub(crate) struct IndexKey {
    pub(crate) file: FileId,
    pub(crate) start: u64,
}

/// A refcounted handle to one power-of-two block inside an arena.
///
/// The handle is shared between the cached-range index, the eviction policy,
/// and any number of in-flight readers. All lifecycle state lives in a single
/// atomic word so that pinning and invalidation race deterministically: a
/// concurrent `inc_ref` and `invalidate` agree on exactly one winner.
///
/// Lifecycle: created by the allocator (or as an unallocated placeholder for
/// asynchronous decompression), published to the index, pinned and released
/// by readers, and finally invalidated by the eviction policy once the
/// refcount has dropped to zero.
pub struct CacheBuffer {
    state: AtomicU64,
    location: OnceLock<Location>,
    /// Bytes of meaningful data, which may be less than the block length
    /// after decompressing the final block of a stream.
    declared_len: AtomicU32,
    /// Node id on the policy's eviction list.
    pub(crate) policy_slot: AtomicUsize,
    pub(crate) index_key: OnceLock<IndexKey>,
}

impl CacheBuffer {
    /// Create a placeholder with no backing memory. The creator holds the
    /// initial pin. Used by the stream reader so handle identity exists
    /// before decompression targets are allocated.
    pub fn unallocated() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU64::new(1),
            location: OnceLock::new(),
            declared_len: AtomicU32::new(0),
            policy_slot: AtomicUsize::new(NO_POLICY_SLOT),
            index_key: OnceLock::new(),
        })
    }

    /// Assign physical backing. Panics if the handle is already backed.
    pub(crate) fn assign(&self, location: Location) {
        let len = location.len;
        if self.location.set(location).is_err() {
            strata_panic!("buffer already has backing memory");
        }
        self.declared_len.store(len, Ordering::Release);
    }

    pub(crate) fn location(&self) -> Option<&Location> {
        self.location.get()
    }

    /// Whether backing memory has been assigned.
    pub fn is_allocated(&self) -> bool {
        self.location.get().is_some()
    }

    /// The block length in bytes. Zero for unallocated placeholders.
    pub fn len(&self) -> usize {
        self.location.get().map(|l| l.len as usize).unwrap_or(0)
    }

    /// Whether the handle has no backing memory.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The index of the owning arena. Panics on unallocated placeholders.
    pub fn arena_index(&self) -> u32 {
        self.loc().arena_index
    }

    /// The byte offset of the block within its arena.
    pub fn offset(&self) -> u32 {
        self.loc().offset
    }

    fn loc(&self) -> &Location {
        self.location.get().strata_expect("buffer is unallocated")
    }

    /// Pin the buffer. Fails iff the buffer has been invalidated; the caller
    /// must then treat the buffer as a cache miss.
    pub fn inc_ref(&self) -> bool {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            if state & FLAG_INVALIDATED != 0 {
                return false;
            }
            if state & REFCOUNT_MASK == REFCOUNT_MASK {
                strata_panic!("buffer refcount overflow");
            }
            match self.state.compare_exchange_weak(
                state,
                state + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => state = actual,
            }
        }
    }

    /// Unpin the buffer, returning the new refcount.
    pub fn dec_ref(&self) -> u32 {
        let prev = self.state.fetch_sub(1, Ordering::AcqRel);
        if prev & REFCOUNT_MASK == 0 {
            strata_panic!("buffer refcount underflow");
        }
        ((prev & REFCOUNT_MASK) - 1) as u32
    }

    /// The current refcount.
    pub fn ref_count(&self) -> u32 {
        (self.state.load(Ordering::Acquire) & REFCOUNT_MASK) as u32
    }

    /// One-way transition to the dead state. Succeeds iff the refcount is
    /// zero and the buffer is not already invalidated; a pin racing with this
    /// call observes either a live buffer or the sentinel, never both.
    pub fn invalidate(&self) -> bool {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            if state & (REFCOUNT_MASK | FLAG_INVALIDATED) != 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                state,
                state | FLAG_INVALIDATED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => state = actual,
            }
        }
    }

    /// Whether the buffer has been invalidated.
    pub fn is_invalidated(&self) -> bool {
        self.state.load(Ordering::Acquire) & FLAG_INVALIDATED != 0
    }

    pub(crate) fn mark_cached(&self) {
        self.state.fetch_or(FLAG_CACHED, Ordering::AcqRel);
    }

    /// Whether the buffer has ever been registered with the index.
    pub fn is_cached(&self) -> bool {
        self.state.load(Ordering::Acquire) & FLAG_CACHED != 0
    }

    /// Record how many leading bytes of the block carry meaningful data.
    pub fn set_declared_len(&self, len: usize) {
        debug_assert!(len <= self.len());
        self.declared_len.store(len as u32, Ordering::Release);
    }

    /// Bytes of meaningful data in the block.
    pub fn declared_len(&self) -> usize {
        self.declared_len.load(Ordering::Acquire) as usize
    }

    /// The full block contents.
    ///
    /// Readers must hold a pin. The returned slice is valid for the lifetime
    /// of the borrow: the arena region is kept alive by the handle, and the
    /// block cannot be reused until the handle is invalidated, which requires
    /// the refcount to be zero.
    pub fn as_slice(&self) -> &[u8] {
        let loc = self.loc();
        // SAFETY: the block [offset, offset+len) is exclusively owned by this
        // handle until deallocation. Writers finish (via `as_mut_slice`)
        // before the buffer is published to the index, and publication
        // happens-before any reader pin, so no write can overlap this read.
        unsafe {
            std::slice::from_raw_parts(loc.region.base().add(loc.offset as usize), loc.len as usize)
        }
    }

    /// The meaningful prefix of the block, per [`Self::declared_len`].
    pub fn data(&self) -> &[u8] {
        &self.as_slice()[..self.declared_len()]
    }

    /// Mutable access to the block for the producing writer.
    ///
    /// # Safety
    ///
    /// The caller must be the sole producer of this buffer: no other thread
    /// may read or write the block until the buffer has been published via
    /// `put_file_data`. This holds for freshly allocated buffers that have
    /// not yet been handed to the index.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        let loc = self.loc();
        // SAFETY: exclusivity is the caller's contract; the pointer is in
        // bounds by construction of `Location`.
        unsafe {
            std::slice::from_raw_parts_mut(
                loc.region.base().add(loc.offset as usize),
                loc.len as usize,
            )
        }
    }

    /// Copy `src` into the head of the block and set the declared length.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::as_mut_slice`].
    pub unsafe fn write_all(&self, src: &[u8]) {
        // SAFETY: forwarded contract.
        let dst = unsafe { self.as_mut_slice() };
        dst[..src.len()].copy_from_slice(src);
        self.set_declared_len(src.len());
    }
}

impl Debug for CacheBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.state.load(Ordering::Acquire);
        f.debug_struct("CacheBuffer")
            .field("refcount", &(state & REFCOUNT_MASK))
            .field("cached", &(state & FLAG_CACHED != 0))
            .field("invalidated", &(state & FLAG_INVALIDATED != 0))
            .field("len", &self.len())
            .field(
                "arena",
                &self.location.get().map(|l| (l.arena_index, l.offset)),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_unpin() {
        let buf = CacheBuffer::unallocated();
        assert_eq!(buf.ref_count(), 1);
        assert!(buf.inc_ref());
        assert_eq!(buf.ref_count(), 2);
        assert_eq!(buf.dec_ref(), 1);
        assert_eq!(buf.dec_ref(), 0);
    }

    #[test]
    fn invalidate_requires_zero_refcount() {
        let buf = CacheBuffer::unallocated();
        assert!(!buf.invalidate());
        buf.dec_ref();
        assert!(buf.invalidate());
        assert!(buf.is_invalidated());
    }

    #[test]
    fn invalidate_is_one_way() {
        let buf = CacheBuffer::unallocated();
        buf.dec_ref();
        assert!(buf.invalidate());
        assert!(!buf.invalidate());
    }

    #[test]
    fn pin_fails_after_invalidate() {
        let buf = CacheBuffer::unallocated();
        buf.dec_ref();
        assert!(buf.invalidate());
        assert!(!buf.inc_ref());
        assert_eq!(buf.ref_count(), 0);
    }

    #[test]
    fn pin_beats_invalidate() {
        let buf = CacheBuffer::unallocated();
        // refcount 1: a concurrent evictor loses.
        assert!(!buf.invalidate());
        assert!(buf.inc_ref());
        assert_eq!(buf.ref_count(), 2);
    }

    #[test]
    fn cached_flag_is_sticky() {
        let buf = CacheBuffer::unallocated();
        assert!(!buf.is_cached());
        buf.mark_cached();
        assert!(buf.is_cached());
        buf.dec_ref();
        buf.invalidate();
        assert!(buf.is_cached());
    }
}
