use bytes::Bytes;
use strata_cache::ByteRange;
use strata_error::{strata_bail, StrataResult};

/// Reads byte ranges out of one columnar file.
///
/// Implementations are expected to be cheap to call concurrently; the cache
/// never serializes reads behind its own locks.
pub trait RangeReader: Send + Sync {
    /// Read exactly `range` from the file.
    fn read_byte_range(&self, range: ByteRange) -> StrataResult<Bytes>;

    /// Hand a buffer back to a zero-copy source. The default implementation
    /// is a no-op for sources that return owned memory.
    fn release_buffer(&self, _raw: Bytes) {}
}

/// A reader over a fully in-memory file image. Used for metadata already
/// resident in memory and throughout the tests.
#[derive(Clone)]
pub struct BytesReader {
    data: Bytes,
}

impl BytesReader {
    /// Wrap an in-memory file image.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    /// Length of the image.
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    /// Whether the image is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl RangeReader for BytesReader {
    fn read_byte_range(&self, range: ByteRange) -> StrataResult<Bytes> {
        if range.end > self.data.len() as u64 {
            strata_bail!(
                Truncated: "range {} extends past the {} byte file image",
                range,
                self.data.len()
            );
        }
        Ok(self.data.slice(range.as_range()))
    }
}

/// A reader over an open file descriptor using positioned reads, so that
/// concurrent readers never contend on a shared cursor.
#[cfg(unix)]
pub struct FileReader {
    file: std::fs::File,
}

#[cfg(unix)]
impl FileReader {
    /// Open `path` for positioned reads.
    pub fn open(path: impl AsRef<std::path::Path>) -> StrataResult<Self> {
        Ok(Self {
            file: std::fs::File::open(path)?,
        })
    }
}

#[cfg(unix)]
impl RangeReader for FileReader {
    fn read_byte_range(&self, range: ByteRange) -> StrataResult<Bytes> {
        use std::os::unix::fs::FileExt;

        let mut buf = vec![0u8; range.len() as usize];
        self.file.read_exact_at(&mut buf, range.begin)?;
        Ok(buf.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_slices() {
        let reader = BytesReader::new(&b"0123456789"[..]);
        let bytes = reader.read_byte_range(ByteRange::new(2, 5)).unwrap();
        assert_eq!(&bytes[..], b"234");
    }

    #[test]
    fn out_of_bounds_is_truncated() {
        let reader = BytesReader::new(&b"0123"[..]);
        let err = reader.read_byte_range(ByteRange::new(2, 5)).unwrap_err();
        assert!(matches!(err, strata_error::StrataError::Truncated(_)));
    }
}
