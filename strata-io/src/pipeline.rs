use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

use strata_cache::{ByteRange, RangeChunk};
use strata_error::{strata_bail, StrataResult};

use crate::reader::RangeReader;

/// Bridges a source reader and the decode path with a bounded queue.
///
/// A dedicated thread resolves ranges through the [`RangeReader`] and feeds
/// them into a channel of `queue_depth` slots; the consuming side drains
/// them in submission order. A full queue blocks the reader (backpressure),
/// a dropped pipeline unblocks and stops it.
pub struct ReadPipeline {
    rx: Option<Receiver<StrataResult<RangeChunk>>>,
    handle: Option<JoinHandle<()>>,
}

impl ReadPipeline {
    /// Start reading `ranges` in order on a background thread.
    pub fn spawn(
        reader: Arc<dyn RangeReader>,
        ranges: Vec<ByteRange>,
        queue_depth: usize,
    ) -> StrataResult<Self> {
        let (tx, rx) = std::sync::mpsc::sync_channel(queue_depth.max(1));
        let handle = std::thread::Builder::new()
            .name("strata-range-reader".into())
            .spawn(move || run_reader(reader, ranges, tx))?;
        Ok(Self {
            rx: Some(rx),
            handle: Some(handle),
        })
    }

    /// The next chunk, in submission order. `None` once the ranges are
    /// exhausted or after an error has been delivered.
    pub fn recv(&self) -> Option<StrataResult<RangeChunk>> {
        self.rx.as_ref().and_then(|rx| rx.recv().ok())
    }
}

impl Iterator for ReadPipeline {
    type Item = StrataResult<RangeChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv()
    }
}

impl Drop for ReadPipeline {
    fn drop(&mut self) {
        // Closing the receiver fails the reader's next send, stopping it.
        drop(self.rx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_reader(
    reader: Arc<dyn RangeReader>,
    ranges: Vec<ByteRange>,
    tx: SyncSender<StrataResult<RangeChunk>>,
) {
    for range in ranges {
        let result = reader
            .read_byte_range(range)
            .map(|bytes| RangeChunk::Data { range, bytes });
        let stop = result.is_err();
        if tx.send(result).is_err() {
            log::debug!("range reader stopping: consumer went away");
            return;
        }
        if stop {
            return;
        }
    }
}

/// Replace every gap in `chunks` with raw data read through `reader`,
/// streaming the reads through a [`ReadPipeline`] of `queue_depth` slots.
pub fn resolve_gaps(
    chunks: &mut [RangeChunk],
    reader: &Arc<dyn RangeReader>,
    queue_depth: usize,
) -> StrataResult<()> {
    let gaps: Vec<ByteRange> = chunks
        .iter()
        .filter(|chunk| chunk.is_gap())
        .map(|chunk| chunk.range())
        .collect();
    if gaps.is_empty() {
        return Ok(());
    }
    let pipeline = ReadPipeline::spawn(reader.clone(), gaps, queue_depth)?;
    for chunk in chunks.iter_mut().filter(|chunk| chunk.is_gap()) {
        match pipeline.recv() {
            Some(Ok(data)) => {
                debug_assert_eq!(data.range(), chunk.range());
                *chunk = data;
            }
            Some(Err(e)) => return Err(e),
            None => strata_bail!("range reader stopped before resolving {}", chunk.range()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::BytesReader;

    fn reader() -> Arc<dyn RangeReader> {
        let data: Vec<u8> = (0..=255u8).collect();
        Arc::new(BytesReader::new(data))
    }

    #[test]
    fn delivers_in_submission_order() {
        let ranges = vec![
            ByteRange::new(10, 20),
            ByteRange::new(0, 5),
            ByteRange::new(100, 101),
        ];
        let pipeline = ReadPipeline::spawn(reader(), ranges.clone(), 2).unwrap();
        let chunks: Vec<RangeChunk> = pipeline.map(Result::unwrap).collect();
        let got: Vec<ByteRange> = chunks.iter().map(RangeChunk::range).collect();
        assert_eq!(got, ranges);
        assert!(matches!(&chunks[2], RangeChunk::Data { bytes, .. } if bytes[0] == 100));
    }

    #[test]
    fn resolves_gaps_in_place() {
        let mut chunks = vec![
            RangeChunk::Gap(ByteRange::new(0, 4)),
            RangeChunk::Data {
                range: ByteRange::new(4, 8),
                bytes: bytes::Bytes::from_static(&[9, 9, 9, 9]),
            },
            RangeChunk::Gap(ByteRange::new(8, 12)),
        ];
        resolve_gaps(&mut chunks, &reader(), 1).unwrap();
        assert!(chunks.iter().all(|c| !c.is_gap()));
        assert!(matches!(&chunks[2], RangeChunk::Data { bytes, .. } if bytes[0] == 8));
    }

    #[test]
    fn backpressure_tolerates_slow_consumers() {
        let ranges: Vec<ByteRange> = (0..64).map(|i| ByteRange::new(i, i + 1)).collect();
        let pipeline = ReadPipeline::spawn(reader(), ranges, 1).unwrap();
        let mut count = 0;
        for chunk in pipeline {
            chunk.unwrap();
            count += 1;
        }
        assert_eq!(count, 64);
    }

    #[test]
    fn read_errors_propagate() {
        let mut chunks = vec![RangeChunk::Gap(ByteRange::new(250, 300))];
        let err = resolve_gaps(&mut chunks, &reader(), 1).unwrap_err();
        assert!(matches!(err, strata_error::StrataError::Truncated(_)));
    }

    #[test]
    fn dropping_early_stops_the_reader() {
        let ranges: Vec<ByteRange> = (0..64).map(|i| ByteRange::new(i, i + 1)).collect();
        let pipeline = ReadPipeline::spawn(reader(), ranges, 1).unwrap();
        let first = pipeline.recv().unwrap().unwrap();
        assert_eq!(first.range(), ByteRange::new(0, 1));
        drop(pipeline);
    }
}
