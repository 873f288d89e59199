use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use strata_cache::{ByteRange, CacheBuffer, DataCache, FileId, RangeChunk};
use strata_error::{strata_bail, StrataExpect, StrataResult};

use crate::codec::BlockCodec;
use crate::header::{BlockHeader, BLOCK_HEADER_SIZE};

/// One compression block awaiting decompression into its target buffer.
struct DecompressJob {
    src: Bytes,
    header: BlockHeader,
    target: Arc<CacheBuffer>,
    range: ByteRange,
    out_index: usize,
    rebuilt_index: usize,
}

/// Materialize the compression blocks spanning `[start_offset, end_offset)`
/// out of a mixed chunk list, one cache buffer per block.
///
/// `chunks` is the probe list after the cached-range index and the source
/// reader have had their turns: cache hits and raw data, no gaps. Cached
/// blocks are reused as-is; raw blocks are carved out (consolidating blocks
/// that straddle chunk boundaries), decompressed in one allocation batch,
/// and published to the index. On return `chunks` describes the same byte
/// span with every consumed raw block replaced by its cached buffer.
///
/// The returned buffers follow compression block order. Their pins are owned
/// by the rewritten `chunks` list: release them in one pass with
/// [`DataCache::release_chunks`] once decoding is done, error or not. On
/// error the carved raw blocks come back as gaps (their buffers never went
/// live); surviving cache hits keep their pins.
///
/// Publish races are resolved here: a block another thread published first
/// is adopted (its buffer replaces ours in both lists) and our duplicate's
/// memory goes straight back to the allocator.
pub fn read_compressed_ranges(
    cache: &DataCache,
    codec: &dyn BlockCodec,
    file: FileId,
    chunks: &mut Vec<RangeChunk>,
    start_offset: u64,
    end_offset: Option<u64>,
    buffer_size: usize,
) -> StrataResult<Vec<Arc<CacheBuffer>>> {
    let mut queue: VecDeque<RangeChunk> = std::mem::take(chunks).into();
    let mut rebuilt: Vec<RangeChunk> = Vec::with_capacity(queue.len());
    let mut out: Vec<Arc<CacheBuffer>> = Vec::new();
    let mut jobs: Vec<DecompressJob> = Vec::new();

    // Pass through everything before the requested compressed region.
    while let Some(chunk) = queue.front() {
        if chunk.range().end <= start_offset {
            rebuilt.push(queue.pop_front().strata_expect("peeked element vanished"));
        } else {
            break;
        }
    }

    let mut pos = start_offset;
    while let Some(chunk) = queue.pop_front() {
        if end_offset.is_some_and(|end| pos >= end) {
            queue.push_front(chunk);
            break;
        }
        match chunk {
            RangeChunk::Gap(range) => {
                strata_bail!(
                    InvalidArgument: "unresolved gap {range} in the compressed range list"
                );
            }
            RangeChunk::Cached { range, buffer } => {
                if pos != range.begin {
                    strata_bail!(
                        InvalidSeek: "offset {pos} is inside cached block {range}"
                    );
                }
                out.push(buffer.clone());
                rebuilt.push(RangeChunk::Cached { range, buffer });
                pos = range.end;
            }
            RangeChunk::Data { range, bytes } => {
                if pos != range.begin {
                    strata_bail!(
                        InvalidSeek: "offset {pos} does not start a compression block ({range})"
                    );
                }
                let bytes = fill_to(pos, bytes, BLOCK_HEADER_SIZE, &mut queue)?;
                let header = BlockHeader::parse([bytes[0], bytes[1], bytes[2]])
                    .checked(buffer_size)?;
                let total = header.block_len();
                let bytes = fill_to(pos, bytes, total, &mut queue)?;
                let body = bytes.slice(BLOCK_HEADER_SIZE..total);
                let block = ByteRange::new(pos, pos + total as u64);
                if bytes.len() > total {
                    queue.push_front(RangeChunk::Data {
                        range: ByteRange::new(block.end, pos + bytes.len() as u64),
                        bytes: bytes.slice(total..),
                    });
                }

                let target = cache.create_unallocated();
                jobs.push(DecompressJob {
                    src: body,
                    header,
                    target: target.clone(),
                    range: block,
                    out_index: out.len(),
                    rebuilt_index: rebuilt.len(),
                });
                out.push(target.clone());
                // Visible to later row groups of this read before it is
                // allocated; the decompress below fills it first.
                rebuilt.push(RangeChunk::Cached {
                    range: block,
                    buffer: target,
                });
                pos = block.end;
            }
        }
    }
    rebuilt.extend(queue);

    if jobs.is_empty() {
        *chunks = rebuilt;
        return Ok(out);
    }

    let targets: Vec<Arc<CacheBuffer>> = jobs.iter().map(|job| job.target.clone()).collect();
    if let Err(e) = cache.allocator().allocate_multiple(&targets, buffer_size) {
        // A partial failure leaves some handles backed; return their memory.
        for target in &targets {
            cache.allocator().deallocate(target);
        }
        *chunks = strip_carved(rebuilt, &jobs);
        return Err(e);
    }

    for job in &jobs {
        let written = if job.header.is_original {
            // SAFETY: the target was allocated above and has not been
            // published; this thread is its sole producer.
            unsafe { job.target.write_all(&job.src) };
            Ok(job.src.len())
        } else {
            // SAFETY: as above.
            let dst = unsafe { job.target.as_mut_slice() };
            codec.decompress(&job.src, dst)
        };
        match written {
            Ok(n) => job.target.set_declared_len(n),
            Err(e) => {
                log::warn!("decompression failed at {}: {e}", job.range);
                for job in &jobs {
                    cache.allocator().deallocate(&job.target);
                }
                *chunks = strip_carved(rebuilt, &jobs);
                return Err(e);
            }
        }
    }

    let ranges: Vec<ByteRange> = jobs.iter().map(|job| job.range).collect();
    let mut published: Vec<Arc<CacheBuffer>> = targets;
    if let Some(mask) = cache.put_file_data(file, &ranges, &mut published, 0) {
        for (i, job) in jobs.iter().enumerate() {
            if mask[i / 64] >> (i % 64) & 1 == 0 {
                continue;
            }
            // Lost the publish race: adopt the winner, free our duplicate.
            let winner = published[i].clone();
            cache.allocator().deallocate(&job.target);
            out[job.out_index] = winner.clone();
            rebuilt[job.rebuilt_index] = RangeChunk::Cached {
                range: job.range,
                buffer: winner,
            };
        }
    }
    *chunks = rebuilt;

    Ok(out)
}

/// Error path: the carved raw blocks never became live cache buffers. Put
/// gaps back in their place so the caller's list never references an
/// unallocated or reclaimed handle.
fn strip_carved(mut rebuilt: Vec<RangeChunk>, jobs: &[DecompressJob]) -> Vec<RangeChunk> {
    for job in jobs {
        rebuilt[job.rebuilt_index] = RangeChunk::Gap(job.range);
    }
    rebuilt
}

/// Grow `bytes` to at least `need` bytes by consuming contiguous raw chunks
/// from the queue, pushing back any unused tail. Zero-copy when the current
/// chunk already suffices.
fn fill_to(
    begin: u64,
    bytes: Bytes,
    need: usize,
    queue: &mut VecDeque<RangeChunk>,
) -> StrataResult<Bytes> {
    if bytes.len() >= need {
        return Ok(bytes);
    }
    let mut merged = BytesMut::with_capacity(need);
    merged.extend_from_slice(&bytes);
    while merged.len() < need {
        let end = begin + merged.len() as u64;
        match queue.pop_front() {
            Some(RangeChunk::Data { range, bytes: more }) if range.begin == end => {
                let take = (need - merged.len()).min(more.len());
                merged.extend_from_slice(&more[..take]);
                if take < more.len() {
                    queue.push_front(RangeChunk::Data {
                        range: ByteRange::new(range.begin + take as u64, range.end),
                        bytes: more.slice(take..),
                    });
                }
            }
            Some(RangeChunk::Cached { .. }) => {
                strata_bail!(BadFormat: "compressed block at {begin} extends into cached data");
            }
            _ => {
                strata_bail!(
                    Truncated: "input ended while reading a compressed block at {begin}"
                );
            }
        }
    }
    Ok(merged.freeze())
}
