use strata_error::{strata_bail, StrataResult};

/// Size of the header preceding every compression block.
pub const BLOCK_HEADER_SIZE: usize = 3;

/// The 3-byte little-endian header of one compression block: bit 0 of the
/// first byte flags an uncompressed passthrough block, the remaining 23 bits
/// carry the body length.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// The block body is stored uncompressed.
    pub is_original: bool,
    /// Length in bytes of the block body following the header.
    pub chunk_length: usize,
}

impl BlockHeader {
    /// Decode a header from its three bytes.
    pub fn parse(bytes: [u8; BLOCK_HEADER_SIZE]) -> Self {
        let [b0, b1, b2] = bytes.map(usize::from);
        Self {
            is_original: b0 & 0x01 == 1,
            chunk_length: (b2 << 15) | (b1 << 7) | (b0 >> 1),
        }
    }

    /// Reject bodies larger than the configured compression buffer.
    pub fn checked(self, buffer_size: usize) -> StrataResult<Self> {
        if self.chunk_length > buffer_size {
            strata_bail!(
                BadFormat: "buffer size too small: size = {}, needed = {}",
                buffer_size,
                self.chunk_length
            );
        }
        Ok(self)
    }

    /// Encode the header back into its three bytes.
    pub fn encode(&self) -> [u8; BLOCK_HEADER_SIZE] {
        [
            (((self.chunk_length & 0x7F) << 1) | usize::from(self.is_original)) as u8,
            (self.chunk_length >> 7) as u8,
            (self.chunk_length >> 15) as u8,
        ]
    }

    /// Total on-disk footprint of the block, header included.
    pub fn block_len(&self) -> usize {
        BLOCK_HEADER_SIZE + self.chunk_length
    }
}
