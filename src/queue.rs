//! Raw trace-data bookkeeping.
//!
//! Trace data arrives as notifications describing byte ranges within a
//! backing store. Each range is queued on the stream (CPU or thread) that
//! produced it and handed to that stream's decoder on demand, in arrival
//! order. In snapshot mode the same physical ring buffer may have been read
//! out twice, so consecutive-looking chunks can share bytes; the duplicated
//! prefix is trimmed before the decoder sees it.

use crate::errors::Error;
use memmap2::Mmap;
use std::{collections::VecDeque, fs::File, sync::Arc};
use tracing::{debug, trace};

/// A trace-data notification.
#[derive(Clone, Debug)]
pub struct ChunkDesc {
    /// Owning CPU; `None` for per-thread (global buffer) traces.
    pub cpu: Option<u32>,
    pub pid: i32,
    pub tid: i32,
    /// Byte offset within the backing store.
    pub offset: u64,
    pub size: u64,
    /// Timestamp taken when the data was captured; used to seed ordering
    /// before the stream has decoded a timestamp of its own.
    pub ref_timestamp: u64,
    /// Data was cut short by the capture layer.
    pub truncated: bool,
    /// Ring-buffer data was overwritten before it could be read (snapshot
    /// mode).
    pub overwritten: bool,
}

/// Where chunk bytes actually live.
pub trait TraceStore {
    /// Fetch `size` bytes at `offset`. Fails with [Error::TraceData] when the
    /// range is outside the store.
    fn fetch(&self, offset: u64, size: u64) -> Result<Arc<[u8]>, Error>;
}

/// A store over bytes already in memory.
pub struct VecStore {
    data: Vec<u8>,
}

impl VecStore {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl TraceStore for VecStore {
    fn fetch(&self, offset: u64, size: u64) -> Result<Arc<[u8]>, Error> {
        range_of(&self.data, offset, size)
    }
}

/// A store over a memory-mapped trace file.
pub struct FileStore {
    map: Mmap,
}

impl FileStore {
    pub fn new(file: &File) -> std::io::Result<Self> {
        // Unsafe in the usual mmap sense: the mapping must not be truncated
        // behind our back.
        let map = unsafe { Mmap::map(file)? };
        Ok(Self { map })
    }
}

impl TraceStore for FileStore {
    fn fetch(&self, offset: u64, size: u64) -> Result<Arc<[u8]>, Error> {
        range_of(&self.map, offset, size)
    }
}

fn range_of(data: &[u8], offset: u64, size: u64) -> Result<Arc<[u8]>, Error> {
    let end = offset.checked_add(size).filter(|e| *e <= data.len() as u64);
    match end {
        Some(end) => Ok(Arc::from(&data[offset as usize..end as usize])),
        None => Err(Error::TraceData { offset, size }),
    }
}

/// One queued chunk with its fetched bytes.
pub(crate) struct TraceChunk {
    pub(crate) desc: ChunkDesc,
    data: Arc<[u8]>,
    /// Bytes to skip at the front after an overlap trim.
    use_off: usize,
    trimmed: bool,
}

impl TraceChunk {
    pub(crate) fn new(desc: ChunkDesc, data: Arc<[u8]>) -> Self {
        Self {
            desc,
            data,
            use_off: 0,
            trimmed: false,
        }
    }

    /// The chunk's usable bytes.
    pub(crate) fn bytes(&self) -> Arc<[u8]> {
        if self.use_off == 0 {
            Arc::clone(&self.data)
        } else {
            Arc::from(&self.data[self.use_off..])
        }
    }

    /// Trim the prefix this chunk shares with the end of `prev`. Trimming is
    /// applied at most once; repeating it never changes the byte range.
    pub(crate) fn trim_against(&mut self, prev: &TraceChunk) {
        if self.trimmed {
            return;
        }
        self.use_off = find_overlap(&prev.data[prev.use_off..], &self.data);
        self.trimmed = true;
        if self.use_off != 0 {
            trace!(
                offset = self.desc.offset,
                skipped = self.use_off,
                "trimmed snapshot overlap"
            );
        }
    }
}

/// Length of the longest suffix of `prev` that is also a prefix of `cur`.
fn find_overlap(prev: &[u8], cur: &[u8]) -> usize {
    let max = prev.len().min(cur.len());
    for len in (1..=max).rev() {
        if prev[prev.len() - len..] == cur[..len] {
            return len;
        }
    }
    0
}

/// The bytes handed to a stream decoder for one step.
pub struct Supply {
    pub data: Arc<[u8]>,
    /// Whether these bytes directly follow the previously supplied ones in
    /// the original stream.
    pub consecutive: bool,
    /// The capture layer cut this chunk short; data after it is missing.
    pub truncated: bool,
}

/// Supplies a stream decoder with byte ranges on demand.
pub trait ByteSource {
    /// The next unconsumed byte range, or `None` when no data is currently
    /// available.
    fn next_bytes(&mut self) -> Result<Option<Supply>, Error>;
}

/// Per-stream chunk list, consumed strictly in arrival order.
pub struct ChunkQueue {
    pending: VecDeque<ChunkDesc>,
    /// The chunk currently being decoded. Kept until replaced because the
    /// next chunk's overlap trim needs its tail bytes.
    cur: Option<TraceChunk>,
    snapshot: bool,
    /// Cooperative cancellation: report no data until cleared.
    pub stop: bool,
    /// Stop after each buffer (piped/sampling input).
    pub step_through_buffers: bool,
}

impl ChunkQueue {
    pub fn new(snapshot: bool) -> Self {
        Self {
            pending: VecDeque::new(),
            cur: None,
            snapshot,
            stop: false,
            step_through_buffers: false,
        }
    }

    pub fn add_chunk(&mut self, desc: ChunkDesc) {
        trace!(
            offset = desc.offset,
            size = desc.size,
            cpu = ?desc.cpu,
            tid = desc.tid,
            "queued trace chunk"
        );
        self.pending.push_back(desc);
    }

    /// Reference timestamp of the oldest unconsumed chunk.
    pub fn next_ref_timestamp(&self) -> Option<u64> {
        self.pending.front().map(|d| d.ref_timestamp)
    }

    /// Advance to the next chunk and hand out its bytes.
    pub fn next_bytes(&mut self, store: &dyn TraceStore) -> Result<Option<Supply>, Error> {
        if self.stop {
            return Ok(None);
        }
        let Some(desc) = self.pending.pop_front() else {
            return Ok(None);
        };

        let data = if desc.overwritten {
            // Nothing to decode, but the gap must still be visible.
            Arc::from(&[][..])
        } else {
            store.fetch(desc.offset, desc.size)?
        };

        let consecutive = match &self.cur {
            Some(prev) => prev.desc.offset + prev.desc.size == desc.offset,
            None => false,
        };

        let mut chunk = TraceChunk::new(desc, data);
        if self.snapshot && !consecutive {
            if let Some(prev) = &self.cur {
                chunk.trim_against(prev);
            }
        }

        let supply = Supply {
            data: chunk.bytes(),
            consecutive,
            truncated: chunk.desc.truncated,
        };

        self.cur = Some(chunk);

        if self.step_through_buffers {
            self.stop = true;
        }

        debug!(
            offset = self.cur.as_ref().map(|c| c.desc.offset),
            consecutive,
            len = supply.data.len(),
            "supplying trace bytes"
        );
        Ok(Some(supply))
    }
}

#[cfg(test)]
mod tests {
    use super::{find_overlap, ChunkDesc, ChunkQueue, TraceChunk, TraceStore, VecStore};
    use std::sync::Arc;

    fn desc(offset: u64, size: u64) -> ChunkDesc {
        ChunkDesc {
            cpu: Some(0),
            pid: 1,
            tid: 1,
            offset,
            size,
            ref_timestamp: 0,
            truncated: false,
            overwritten: false,
        }
    }

    #[test]
    fn chunks_come_out_in_arrival_order() {
        let store = VecStore::new((0u8..100).collect());
        let mut q = ChunkQueue::new(false);
        q.add_chunk(desc(0, 10));
        q.add_chunk(desc(10, 5));
        q.add_chunk(desc(40, 5));

        let s = q.next_bytes(&store).unwrap().unwrap();
        assert_eq!(&s.data[..], &(0u8..10).collect::<Vec<_>>()[..]);
        assert!(!s.consecutive);

        let s = q.next_bytes(&store).unwrap().unwrap();
        assert_eq!(&s.data[..], &[10, 11, 12, 13, 14]);
        assert!(s.consecutive);

        // A gap in store offsets is not consecutive.
        let s = q.next_bytes(&store).unwrap().unwrap();
        assert!(!s.consecutive);

        assert!(q.next_bytes(&store).unwrap().is_none());
    }

    #[test]
    fn stop_flag_reports_no_data() {
        let store = VecStore::new(vec![0; 16]);
        let mut q = ChunkQueue::new(false);
        q.add_chunk(desc(0, 8));
        q.stop = true;
        assert!(q.next_bytes(&store).unwrap().is_none());
        q.stop = false;
        assert!(q.next_bytes(&store).unwrap().is_some());
    }

    #[test]
    fn step_through_buffers_stops_after_each_chunk() {
        let store = VecStore::new(vec![0; 16]);
        let mut q = ChunkQueue::new(false);
        q.step_through_buffers = true;
        q.add_chunk(desc(0, 8));
        q.add_chunk(desc(8, 8));
        assert!(q.next_bytes(&store).unwrap().is_some());
        assert!(q.next_bytes(&store).unwrap().is_none());
        q.stop = false;
        assert!(q.next_bytes(&store).unwrap().is_some());
    }

    #[test]
    fn out_of_range_chunk_is_an_error() {
        let store = VecStore::new(vec![0; 16]);
        let mut q = ChunkQueue::new(false);
        q.add_chunk(desc(8, 16));
        assert!(q.next_bytes(&store).is_err());
    }

    #[test]
    fn snapshot_overlap_is_trimmed() {
        // Two reads of the same ring buffer: the second starts with the last
        // four bytes of the first.
        let first = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
        let second = vec![5u8, 6, 7, 8, 9, 10];
        let mut store_bytes = first.clone();
        store_bytes.extend(&second);
        let store = VecStore::new(store_bytes);

        let mut q = ChunkQueue::new(true);
        q.add_chunk(desc(0, 8));
        let s1 = q.next_bytes(&store).unwrap().unwrap();
        assert_eq!(&s1.data[..], &first[..]);

        // Consecutive store offsets never trim.
        q.add_chunk(desc(8, 6));
        let s2 = q.next_bytes(&store).unwrap().unwrap();
        assert!(s2.consecutive);
        assert_eq!(&s2.data[..], &second[..]);

        // The direct trim path.
        let a = TraceChunk::new(desc(0, 8), Arc::from(&first[..]));
        let mut b = TraceChunk::new(desc(100, 6), Arc::from(&second[..]));
        b.trim_against(&a);
        assert_eq!(&b.bytes()[..], &[9, 10]);
    }

    #[test]
    fn trim_is_idempotent() {
        let a = TraceChunk::new(desc(0, 4), Arc::from(&[1u8, 2, 3, 4][..]));
        let mut b = TraceChunk::new(desc(100, 5), Arc::from(&[3u8, 4, 5, 3, 4][..]));
        b.trim_against(&a);
        let once = b.bytes();
        // The trimmed suffix itself begins with bytes matching `a`'s tail, so
        // a second trim would cut more if it were not suppressed.
        b.trim_against(&a);
        assert_eq!(&b.bytes()[..], &once[..]);
    }

    #[test]
    fn overlap_lengths() {
        assert_eq!(find_overlap(&[1, 2, 3], &[2, 3, 4]), 2);
        assert_eq!(find_overlap(&[1, 2, 3], &[1, 2, 3]), 3);
        assert_eq!(find_overlap(&[1, 2, 3], &[4, 5]), 0);
        assert_eq!(find_overlap(&[], &[1]), 0);
    }
}
