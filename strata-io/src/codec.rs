use strata_error::StrataResult;

/// Decompresses one compression block into a caller-provided buffer.
///
/// The engine wires in the codec matching the file's postscript; the cache
/// itself never inspects block bodies beyond the 3-byte header.
pub trait BlockCodec: Send + Sync {
    /// Decompress `src` into `dst`, returning the decompressed length.
    /// Signals `BadFormat` on malformed input or when `dst` is too small.
    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> StrataResult<usize>;
}
