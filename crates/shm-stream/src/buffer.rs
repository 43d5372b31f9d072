//! Local buffering with high-water-mark accounting.
//!
//! These are the stream-side collaborators of the adapters: they know nothing
//! about shared memory, only about queued chunks and how many bytes are parked
//! in them.

use std::collections::VecDeque;

use bytes::Bytes;

/// Default high-water mark for both directions (bytes).
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;

/// FIFO of delivered-but-unread chunks on the consumer side.
#[derive(Debug)]
pub struct ReadBuffer {
    chunks: VecDeque<Bytes>,
    bytes: usize,
    high_water_mark: usize,
}

impl ReadBuffer {
    pub fn new(high_water_mark: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            high_water_mark,
        }
    }

    /// Queue a chunk. Returns whether more data is wanted.
    pub fn push(&mut self, chunk: Bytes) -> bool {
        self.bytes += chunk.len();
        self.chunks.push_back(chunk);
        self.wants_more()
    }

    pub fn pop(&mut self) -> Option<Bytes> {
        let chunk = self.chunks.pop_front()?;
        self.bytes -= chunk.len();
        Some(chunk)
    }

    pub fn wants_more(&self) -> bool {
        self.bytes < self.high_water_mark
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.bytes
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.bytes = 0;
    }
}

/// A batch waiting to be published, tagged with its publication sequence.
#[derive(Debug)]
pub struct PendingBatch {
    pub seq: u64,
    pub chunks: Vec<Bytes>,
}

/// Pending write queue on the producer side.
///
/// Sealed batches are published in sequence order. At most one open batch
/// collects corked writes; it is sealed on the final uncork or on flush.
#[derive(Debug)]
pub struct WriteQueue {
    sealed: VecDeque<PendingBatch>,
    open: Option<PendingBatch>,
    next_seq: u64,
    bytes: usize,
    high_water_mark: usize,
}

impl WriteQueue {
    pub fn new(high_water_mark: usize) -> Self {
        Self {
            sealed: VecDeque::new(),
            open: None,
            next_seq: 1,
            bytes: 0,
            high_water_mark,
        }
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Queue `chunks` as their own batch. Returns the batch sequence.
    pub fn push_batch(&mut self, chunks: Vec<Bytes>) -> u64 {
        debug_assert!(self.open.is_none(), "sealed batch queued behind an open one");
        let seq = self.take_seq();
        self.bytes += chunks.iter().map(Bytes::len).sum::<usize>();
        self.sealed.push_back(PendingBatch { seq, chunks });
        seq
    }

    /// Append to the open (corked) batch. Returns its sequence.
    pub fn push_open(&mut self, chunks: impl IntoIterator<Item = Bytes>) -> u64 {
        let mut batch = match self.open.take() {
            Some(batch) => batch,
            None => PendingBatch {
                seq: self.take_seq(),
                chunks: Vec::new(),
            },
        };
        for chunk in chunks {
            self.bytes += chunk.len();
            batch.chunks.push(chunk);
        }
        let seq = batch.seq;
        self.open = Some(batch);
        seq
    }

    /// Close the open batch so it can be published.
    pub fn seal_open(&mut self) {
        if let Some(batch) = self.open.take() {
            self.sealed.push_back(batch);
        }
    }

    pub fn has_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn has_sealed(&self) -> bool {
        !self.sealed.is_empty()
    }

    pub fn pop_sealed(&mut self) -> Option<PendingBatch> {
        let batch = self.sealed.pop_front()?;
        self.bytes -= batch.chunks.iter().map(Bytes::len).sum::<usize>();
        Some(batch)
    }

    /// Sequence of the most recently queued batch (0 if none ever was).
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn is_empty(&self) -> bool {
        self.sealed.is_empty() && self.open.is_none()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.bytes
    }

    /// True once the queued bytes reach the high-water mark.
    pub fn needs_drain(&self) -> bool {
        self.bytes >= self.high_water_mark
    }

    /// Drop everything still queued. Returns the number of discarded chunks.
    pub fn clear(&mut self) -> usize {
        let dropped = self.sealed.iter().map(|b| b.chunks.len()).sum::<usize>()
            + self.open.as_ref().map_or(0, |b| b.chunks.len());
        self.sealed.clear();
        self.open = None;
        self.bytes = 0;
        dropped
    }
}
