#![deny(missing_docs)]

//! Compressed stream reading on top of the strata data cache.
//!
//! The on-disk unit is the compression block: a 3-byte header (passthrough
//! flag plus 23-bit body length) followed by the body. One decompressed
//! block becomes one cache buffer, keyed by the block's compressed byte
//! range, so overlapping row groups land on the same entries.
//!
//! Two consumption styles over the same machinery:
//!
//! * [`read_compressed_ranges`] materializes every block in a region in one
//!   batch: one allocator round-trip, then decompression and publication,
//!   preserving block order in its output.
//! * [`CompressedStream`] is a pull-based seekable reader that materializes
//!   blocks on demand.
//!
//! Raw bytes come from a [`RangeReader`]; gaps reported by the cache are
//! resolved through a bounded-queue [`ReadPipeline`] so storage reads and
//! decompression overlap without unbounded buffering.

mod codec;
mod encoded;
mod header;
mod pipeline;
mod reader;
mod stream;

pub use codec::BlockCodec;
pub use encoded::read_compressed_ranges;
pub use header::{BlockHeader, BLOCK_HEADER_SIZE};
pub use pipeline::{resolve_gaps, ReadPipeline};
pub use reader::{BytesReader, RangeReader};
#[cfg(unix)]
pub use reader::FileReader;
pub use stream::CompressedStream;
