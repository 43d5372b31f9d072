//! Request/acknowledge handshake over the two control words.
//!
//! Reader word: `Idle` (no demand) → `Signaled` (reader wants a batch).
//! Writer word: `Idle` (data area free) → `Signaled` (batch published) →
//! `Idle` (batch consumed). Either word may move to `Closed`, which is terminal.
//!
//! Every suspension point is expressed as a [`Gate`]: either the condition is
//! already decided, or the caller must wait for a word to leave a value. The
//! blocking and the task-based paths both evaluate the same gate functions and
//! only differ in how they wait, see [`block_on_gate`] and [`poll_gate`].

use std::task::{Context, Poll};

use bytes::Bytes;

use crate::codec;
use crate::error::{Result, ShmError};
use crate::layout::WordState;
use crate::region::ShmRegion;
use crate::word::{WaitKey, WordId};

/// Waiters woken when a batch is published (the reader).
pub const PUBLISH_WAKE_COUNT: usize = 1;

/// Waiters woken when a batch is acknowledged: a task and a blocked thread may
/// both be waiting on the writer word for the same acknowledgment.
pub const ACK_WAKE_COUNT: usize = 2;

/// Waiters woken when the reader asks for a batch.
pub const DEMAND_WAKE_COUNT: usize = 1;

/// Outcome of evaluating a suspension point.
#[derive(Debug)]
pub enum Gate {
    Open(Result<()>),
    /// Wait for `word` to leave `state`, then evaluate again.
    Wait(WordId, WordState),
}

/// Drive `gate` to completion by parking the calling thread.
pub fn block_on_gate(region: &ShmRegion, mut gate: impl FnMut() -> Gate) -> Result<()> {
    loop {
        match gate() {
            Gate::Open(res) => return res,
            Gate::Wait(id, state) => {
                region.word(id).wait(state);
            }
        }
    }
}

/// Drive `gate` from a task. `slot` keeps the waker registration across polls.
pub fn poll_gate(
    region: &ShmRegion,
    cx: &mut Context<'_>,
    slot: &mut Option<WaitKey>,
    mut gate: impl FnMut() -> Gate,
) -> Poll<Result<()>> {
    loop {
        match gate() {
            Gate::Open(res) => {
                cancel_wait(region, slot);
                return Poll::Ready(res);
            }
            Gate::Wait(id, state) => {
                if slot.is_some_and(|k| k.word != id) {
                    cancel_wait(region, slot);
                }
                match region.word(id).poll_wait(cx, state, slot) {
                    Poll::Ready(_) => continue,
                    Poll::Pending => return Poll::Pending,
                }
            }
        }
    }
}

/// Drop a pending task registration, if any.
pub fn cancel_wait(region: &ShmRegion, slot: &mut Option<WaitKey>) {
    if let Some(k) = *slot {
        region.word(k.word).cancel(slot);
    }
}

/// What a call to [`ReaderSide::consume`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumed {
    /// The writer word was still `Idle`; nothing happened.
    Nothing,
    /// A batch of `chunks` chunks was delivered. `more` is the downstream demand.
    Batch { chunks: usize, more: bool },
    /// The writer closed the channel.
    End,
}

/// Consumer half of the handshake.
#[derive(Debug, Clone)]
pub struct ReaderSide {
    region: ShmRegion,
}

impl ReaderSide {
    pub fn new(region: ShmRegion) -> Self {
        Self { region }
    }

    pub fn region(&self) -> &ShmRegion {
        &self.region
    }

    /// Announce demand for one batch.
    ///
    /// Wakes a single waiter: an [`crate::ShmWriter`] parks only its pump on the
    /// reader word, and a blocked `flush_sync` waits on the writer state instead.
    pub fn request_read(&self) {
        let word = self.region.reader_word();
        word.store(WordState::Signaled);
        word.notify(DEMAND_WAKE_COUNT);
        tracing::trace!("reader requested a batch");
    }

    /// Withdraw demand.
    pub fn pause(&self) {
        self.region.reader_word().store(WordState::Idle);
    }

    /// Close the reader word for good and release every waiter.
    pub fn close(&self) {
        self.region.reader_word().store(WordState::Closed);
        self.region.reader_word().notify_all();
        self.region.writer_word().notify_all();
        tracing::debug!("reader closed");
    }

    /// Suspension point: the writer word must leave `Idle`.
    ///
    /// A peer lifecycle event while nothing is published fails the wait.
    pub fn batch_gate(&self) -> Gate {
        match self.region.writer_word().load() {
            WordState::Idle => match self.region.peer_event() {
                Some(event) => Gate::Open(Err(event.to_error())),
                None => Gate::Wait(WordId::Writer, WordState::Idle),
            },
            WordState::Signaled | WordState::Closed => Gate::Open(Ok(())),
        }
    }

    pub fn wait_batch(&self) -> Result<()> {
        block_on_gate(&self.region, || self.batch_gate())
    }

    pub fn poll_batch(&self, cx: &mut Context<'_>, slot: &mut Option<WaitKey>) -> Poll<Result<()>> {
        poll_gate(&self.region, cx, slot, || self.batch_gate())
    }

    /// Take the published batch out of the data area.
    ///
    /// Each decoded chunk is handed to `push`, whose return value is the
    /// downstream demand after that chunk. Demand is settled on the reader word
    /// before the writer word is released, so the writer never publishes into
    /// a paused reader.
    pub fn consume(&self, mut push: impl FnMut(Bytes) -> bool) -> Result<Consumed> {
        let writer = self.region.writer_word();
        match writer.load() {
            WordState::Idle => return Ok(Consumed::Nothing),
            WordState::Closed => {
                tracing::debug!("writer closed, end of stream");
                return Ok(Consumed::End);
            }
            WordState::Signaled => {}
        }

        // The writer word is `Signaled`: the data area is ours until released.
        let chunks = codec::decode(unsafe { self.region.data_area() }, 0)?;
        let count = chunks.len();
        let mut more = true;
        for chunk in chunks {
            more = push(chunk);
        }

        if !more {
            self.pause();
        }
        // A concurrent `Closed` from the writer must survive the release.
        let _ = writer.compare_exchange(WordState::Signaled, WordState::Idle);
        writer.notify(ACK_WAKE_COUNT);
        tracing::trace!(chunks = count, more, "consumed batch");

        if more {
            self.request_read();
        }
        Ok(Consumed::Batch {
            chunks: count,
            more,
        })
    }
}

/// Producer half of the handshake.
#[derive(Debug, Clone)]
pub struct WriterSide {
    region: ShmRegion,
}

impl WriterSide {
    pub fn new(region: ShmRegion) -> Self {
        Self { region }
    }

    pub fn region(&self) -> &ShmRegion {
        &self.region
    }

    fn peer_gone(&self) -> Option<ShmError> {
        if self.region.reader_word().load() == WordState::Closed {
            return Some(ShmError::PrematureClose);
        }
        self.region.peer_event().map(|e| e.to_error())
    }

    /// Suspension point: the reader must have asked for a batch.
    pub fn demand_gate(&self) -> Gate {
        if self.region.writer_word().load() == WordState::Closed {
            return Gate::Open(Err(ShmError::Closed));
        }
        match self.region.reader_word().load() {
            WordState::Signaled => Gate::Open(Ok(())),
            WordState::Closed => Gate::Open(Err(ShmError::PrematureClose)),
            WordState::Idle => match self.region.peer_event() {
                Some(event) => Gate::Open(Err(event.to_error())),
                None => Gate::Wait(WordId::Reader, WordState::Idle),
            },
        }
    }

    /// Suspension point: the published batch must be acknowledged.
    pub fn ack_gate(&self) -> Gate {
        match self.region.writer_word().load() {
            WordState::Idle => Gate::Open(Ok(())),
            WordState::Closed => Gate::Open(Err(ShmError::Closed)),
            WordState::Signaled => match self.peer_gone() {
                Some(err) => Gate::Open(Err(err)),
                None => Gate::Wait(WordId::Writer, WordState::Signaled),
            },
        }
    }

    pub fn await_demand(&self) -> Result<()> {
        block_on_gate(&self.region, || self.demand_gate())
    }

    pub fn poll_demand(&self, cx: &mut Context<'_>, slot: &mut Option<WaitKey>) -> Poll<Result<()>> {
        poll_gate(&self.region, cx, slot, || self.demand_gate())
    }

    pub fn await_ack(&self) -> Result<()> {
        block_on_gate(&self.region, || self.ack_gate())
    }

    pub fn poll_ack(&self, cx: &mut Context<'_>, slot: &mut Option<WaitKey>) -> Poll<Result<()>> {
        poll_gate(&self.region, cx, slot, || self.ack_gate())
    }

    /// Encode `chunks` into the data area and signal the reader.
    ///
    /// Must only be called once demand was observed and the previous batch was
    /// acknowledged. A batch that does not fit leaves the data area and both
    /// words untouched.
    pub fn publish<B: AsRef<[u8]>>(&self, chunks: &[B]) -> Result<usize> {
        let writer = self.region.writer_word();
        match writer.load() {
            WordState::Idle => {}
            WordState::Closed => return Err(ShmError::Closed),
            WordState::Signaled => {
                return Err(ShmError::Io("publish while a batch is in flight".into()))
            }
        }

        let needed = codec::encoded_len(chunks);
        self.region.ensure_data_capacity(needed)?;
        // The writer word is `Idle`: the reader is done with the data area.
        let written = codec::encode(unsafe { self.region.data_area_mut() }, 0, chunks)?;

        writer
            .compare_exchange(WordState::Idle, WordState::Signaled)
            .map_err(|_| ShmError::Closed)?;
        writer.notify(PUBLISH_WAKE_COUNT);
        tracing::trace!(chunks = chunks.len(), bytes = written, "published batch");
        Ok(written)
    }

    /// Close the writer word for good and release every waiter.
    pub fn close(&self) {
        let writer = self.region.writer_word();
        writer.store(WordState::Closed);
        writer.notify_all();
        self.region.reader_word().notify_all();
        tracing::debug!("writer closed");
    }

    pub fn is_closed(&self) -> bool {
        self.region.writer_word().load() == WordState::Closed
    }
}
