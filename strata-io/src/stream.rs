use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use strata_cache::{ByteRange, CacheBuffer, DataCache, FileId, RangeChunk};
use strata_error::{strata_bail, StrataResult};

use crate::codec::BlockCodec;
use crate::header::{BlockHeader, BLOCK_HEADER_SIZE};

enum CurrentData {
    /// A decompressed block living in the cache.
    Cached(Arc<CacheBuffer>),
    /// A passthrough block served straight from the raw bytes.
    Plain(Bytes),
}

struct Current {
    data: CurrentData,
    cursor: usize,
    /// A pin this stream owns (fresh publications), released on advance.
    owned: Option<Arc<CacheBuffer>>,
}

/// A seekable reader over one compressed stream, fed by a mixed list of raw
/// disk ranges and cache hits.
///
/// Blocks are materialized on demand: a cached block is served in place, a
/// raw block is decompressed into a freshly allocated cache buffer and
/// published so overlapping row groups find it. Passthrough blocks are
/// served from the raw bytes without touching the cache.
///
/// Dropping the stream (or calling [`Self::close`]) releases every pin the
/// chunk list carries.
pub struct CompressedStream<'a> {
    cache: &'a DataCache,
    codec: &'a dyn BlockCodec,
    file: FileId,
    chunks: Vec<RangeChunk>,
    buffer_size: usize,
    /// One past the last compressed offset of the stream.
    length: u64,
    pos: u64,
    current: Option<Current>,
    /// Compression block boundaries discovered so far: the stream start,
    /// every cached block's edges, and the edges of each block parsed out of
    /// raw data. Seeks are validated against these.
    boundaries: BTreeSet<u64>,
}

impl<'a> CompressedStream<'a> {
    /// Wrap a chunk list covering the stream's compressed bytes. Reading
    /// starts at the first chunk.
    pub fn new(
        cache: &'a DataCache,
        codec: &'a dyn BlockCodec,
        file: FileId,
        chunks: Vec<RangeChunk>,
        buffer_size: usize,
    ) -> Self {
        let pos = chunks.first().map(|c| c.range().begin).unwrap_or(0);
        let length = chunks.last().map(|c| c.range().end).unwrap_or(0);
        let mut boundaries = BTreeSet::new();
        boundaries.insert(pos);
        for chunk in &chunks {
            if let RangeChunk::Cached { range, .. } = chunk {
                boundaries.insert(range.begin);
                boundaries.insert(range.end);
            }
        }
        Self {
            cache,
            codec,
            file,
            chunks,
            buffer_size,
            length,
            pos,
            current: None,
            boundaries,
        }
    }

    /// Copy decompressed bytes into `dst`, returning how many were written.
    /// Returns 0 only at end of stream.
    pub fn read(&mut self, dst: &mut [u8]) -> StrataResult<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        while self.current_slice().is_empty() {
            if self.pos >= self.length {
                return Ok(0);
            }
            self.read_header()?;
        }
        let src = self.current_slice();
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
        if let Some(current) = self.current.as_mut() {
            current.cursor += n;
        }
        Ok(n)
    }

    /// Fill `dst` completely, or fail with `Truncated`.
    pub fn read_exact(&mut self, dst: &mut [u8]) -> StrataResult<()> {
        let mut filled = 0;
        while filled < dst.len() {
            let n = self.read(&mut dst[filled..])?;
            if n == 0 {
                strata_bail!(
                    Truncated: "stream ended {} bytes short at offset {}",
                    dst.len() - filled,
                    self.pos
                );
            }
            filled += n;
        }
        Ok(())
    }

    /// Decompressed bytes available without crossing a block boundary,
    /// materializing the next block if needed.
    pub fn available(&mut self) -> StrataResult<usize> {
        if self.current_slice().is_empty() && self.pos < self.length {
            self.read_header()?;
        }
        Ok(self.current_slice().len())
    }

    /// Reposition to a compressed offset.
    ///
    /// The offset must fall on a compression block boundary inside the
    /// stream (or exactly at its end); anything else is `InvalidSeek`.
    /// Boundaries in unread raw regions are confirmed by walking block
    /// headers forward from the nearest known boundary.
    pub fn seek(&mut self, offset: u64) -> StrataResult<()> {
        self.release_current();
        if offset == self.length {
            self.pos = offset;
            return Ok(());
        }
        if self.chunk_at(offset).is_none() {
            strata_bail!(
                InvalidSeek: "offset {offset} is outside the stream (length {})",
                self.length
            );
        }
        self.validate_boundary(offset)?;
        self.pos = offset;
        Ok(())
    }

    /// Confirm `offset` starts a compression block, hopping block to block
    /// from the nearest boundary already known and recording every boundary
    /// found on the way.
    fn validate_boundary(&mut self, offset: u64) -> StrataResult<()> {
        if self.boundaries.contains(&offset) {
            return Ok(());
        }
        let Some(mut pos) = self.boundaries.range(..=offset).next_back().copied() else {
            strata_bail!(InvalidSeek: "offset {offset} precedes the stream");
        };
        while pos < offset {
            let Some(idx) = self.chunk_at(pos) else {
                break;
            };
            let next = match &self.chunks[idx] {
                RangeChunk::Gap(range) => {
                    strata_bail!(InvalidArgument: "unresolved gap {range} in the stream")
                }
                RangeChunk::Cached { range, .. } => range.end,
                RangeChunk::Data { .. } => {
                    let mut header = [0u8; BLOCK_HEADER_SIZE];
                    self.gather(idx, pos, &mut header)?;
                    let block = BlockHeader::parse(header).checked(self.buffer_size)?;
                    pos + block.block_len() as u64
                }
            };
            self.boundaries.insert(next);
            pos = next;
        }
        if pos == offset {
            return Ok(());
        }
        strata_bail!(
            InvalidSeek: "offset {offset} does not fall on a compression block boundary"
        )
    }

    /// Release every pin and forget the chunk list. Subsequent reads report
    /// end of stream.
    pub fn close(&mut self) {
        self.release_current();
        self.cache.release_chunks(self.chunks.iter());
        self.chunks.clear();
        self.pos = self.length;
    }

    fn current_slice(&self) -> &[u8] {
        match &self.current {
            None => &[],
            Some(current) => {
                let data = match &current.data {
                    CurrentData::Cached(buffer) => buffer.data(),
                    CurrentData::Plain(bytes) => &bytes[..],
                };
                &data[current.cursor.min(data.len())..]
            }
        }
    }

    fn release_current(&mut self) {
        if let Some(current) = self.current.take() {
            if let Some(owned) = current.owned {
                self.cache.release_buffer(&owned);
            }
        }
    }

    fn chunk_at(&self, offset: u64) -> Option<usize> {
        self.chunks.iter().position(|c| c.range().contains(offset))
    }

    fn read_header(&mut self) -> StrataResult<()> {
        self.release_current();
        let Some(idx) = self.chunk_at(self.pos) else {
            strata_bail!(
                Truncated: "no data at offset {} (length {})",
                self.pos,
                self.length
            );
        };
        match &self.chunks[idx] {
            RangeChunk::Gap(range) => {
                strata_bail!(InvalidArgument: "unresolved gap {range} in the stream")
            }
            RangeChunk::Cached { range, buffer } => {
                if self.pos != range.begin {
                    strata_bail!(
                        InvalidSeek: "cannot start reading inside cached block {range}"
                    );
                }
                let end = range.end;
                self.current = Some(Current {
                    data: CurrentData::Cached(buffer.clone()),
                    cursor: 0,
                    owned: None,
                });
                self.boundaries.insert(end);
                self.pos = end;
                Ok(())
            }
            RangeChunk::Data { .. } => self.read_raw_block(idx),
        }
    }

    fn read_raw_block(&mut self, idx: usize) -> StrataResult<()> {
        let mut header_bytes = [0u8; BLOCK_HEADER_SIZE];
        self.gather(idx, self.pos, &mut header_bytes)?;
        let header = BlockHeader::parse(header_bytes).checked(self.buffer_size)?;
        let mut body = vec![0u8; header.chunk_length];
        self.gather(idx, self.pos + BLOCK_HEADER_SIZE as u64, &mut body)?;
        let block = ByteRange::new(self.pos, self.pos + header.block_len() as u64);
        self.boundaries.insert(block.end);

        if header.is_original {
            self.current = Some(Current {
                data: CurrentData::Plain(body.into()),
                cursor: 0,
                owned: None,
            });
            self.pos = block.end;
            return Ok(());
        }

        let target = self.cache.create_unallocated();
        self.cache
            .allocator()
            .allocate_multiple(std::slice::from_ref(&target), self.buffer_size)?;
        // SAFETY: the buffer was just allocated and is unpublished; this
        // thread is its sole producer.
        let dst = unsafe { target.as_mut_slice() };
        let n = match self.codec.decompress(&body, dst) {
            Ok(n) => n,
            Err(e) => {
                self.cache.allocator().deallocate(&target);
                return Err(e);
            }
        };
        target.set_declared_len(n);

        let mut published = vec![target.clone()];
        if let Some(mask) = self.cache.put_file_data(self.file, &[block], &mut published, 0) {
            if mask[0] & 1 == 1 {
                // A concurrent reader published this block first.
                self.cache.allocator().deallocate(&target);
            }
        }
        let winner = published.remove(0);
        self.current = Some(Current {
            data: CurrentData::Cached(winner.clone()),
            cursor: 0,
            owned: Some(winner),
        });
        self.pos = block.end;
        Ok(())
    }

    /// Fill `dst` with raw stream bytes starting at `from`, walking
    /// contiguous raw chunks from `idx` on.
    fn gather(&self, idx: usize, from: u64, dst: &mut [u8]) -> StrataResult<()> {
        let mut filled = 0;
        let mut cursor = from;
        for chunk in &self.chunks[idx..] {
            if filled == dst.len() {
                break;
            }
            match chunk {
                RangeChunk::Data { range, bytes } => {
                    if cursor < range.begin || cursor > range.end {
                        strata_bail!(
                            Truncated: "stream bytes at {cursor} are not contiguous with {range}"
                        );
                    }
                    let skip = (cursor - range.begin) as usize;
                    let take = (bytes.len() - skip).min(dst.len() - filled);
                    dst[filled..filled + take].copy_from_slice(&bytes[skip..skip + take]);
                    filled += take;
                    cursor += take as u64;
                }
                RangeChunk::Cached { .. } => {
                    strata_bail!(
                        BadFormat: "compressed block at {from} extends into cached data"
                    );
                }
                RangeChunk::Gap(range) => {
                    strata_bail!(InvalidArgument: "unresolved gap {range} in the stream")
                }
            }
        }
        if filled < dst.len() {
            strata_bail!(
                Truncated: "stream ended while reading {} bytes at {from}",
                dst.len()
            );
        }
        Ok(())
    }
}

impl Drop for CompressedStream<'_> {
    fn drop(&mut self) {
        self.close();
    }
}
