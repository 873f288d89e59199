//! Shared fixtures: a toy codec and compression block builders.
#![allow(dead_code)]

use std::sync::Arc;

use strata_cache::{CacheConfig, DataCache, PolicyKind};
use strata_error::{strata_bail, StrataResult};
use strata_io::{BlockCodec, BlockHeader};

/// "Compression" that halves the data: decompression writes every source
/// byte twice. Invertible, length-changing, and trivially verifiable.
pub struct DoublingCodec;

impl BlockCodec for DoublingCodec {
    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> StrataResult<usize> {
        let n = src.len() * 2;
        if n > dst.len() {
            strata_bail!(BadFormat: "decompressed {} bytes into a {} byte buffer", n, dst.len());
        }
        for (i, &b) in src.iter().enumerate() {
            dst[2 * i] = b;
            dst[2 * i + 1] = b;
        }
        Ok(n)
    }
}

/// A codec that rejects everything.
pub struct FailingCodec;

impl BlockCodec for FailingCodec {
    fn decompress(&self, _src: &[u8], _dst: &mut [u8]) -> StrataResult<usize> {
        strata_bail!(BadFormat: "corrupt block")
    }
}

/// Encode one block: header plus body.
pub fn block(body: &[u8], is_original: bool) -> Vec<u8> {
    let header = BlockHeader {
        is_original,
        chunk_length: body.len(),
    };
    let mut bytes = header.encode().to_vec();
    bytes.extend_from_slice(body);
    bytes
}

/// Concatenate blocks into a file image, returning the image and each
/// block's `(begin, end)` compressed footprint.
pub fn file_image(blocks: &[(&[u8], bool)]) -> (Vec<u8>, Vec<(u64, u64)>) {
    let mut image = Vec::new();
    let mut spans = Vec::new();
    for (body, is_original) in blocks {
        let begin = image.len() as u64;
        image.extend_from_slice(&block(body, *is_original));
        spans.push((begin, image.len() as u64));
    }
    (image, spans)
}

pub fn test_cache() -> Arc<DataCache> {
    DataCache::new(
        CacheConfig::builder()
            .min_alloc(8)
            .max_alloc(64)
            .arena_size(256)
            .total_size(2048)
            .policy_kind(PolicyKind::Lru)
            .cleanup_interval(None)
            .build(),
    )
    .unwrap()
}

/// The compression buffer size used throughout these tests.
pub const BUFFER_SIZE: usize = 32;
