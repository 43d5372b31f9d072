//! Producer-facing adapter.
//!
//! Writes are queued as batches in a [`WriteQueue`] and published one at a
//! time through the rendezvous. Every uncorked `write`/`writev` call is its own
//! batch; corked writes collect into one batch that is sealed by the final
//! `uncork`.
//!
//! Publication does not depend on anyone polling a [`WriteFuture`]. Each
//! writer owns a pump: a waker registered on whichever control word currently
//! blocks progress. Queueing a batch runs the pump once, and every later
//! notification on that word runs it again, so batches go out as soon as the
//! reader asks for them and `end()` closes the word once the queue drains.
//!
//! Futures and blocked threads (`flush_sync`, [`WriteFuture::wait`]) only
//! observe: they follow the writer state and are woken when it changes. The
//! pump is therefore the only writer-side waiter on either control word.

use std::future::Future;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, Thread};

use bytes::Bytes;

use crate::buffer::WriteQueue;
use crate::config::ChannelConfig;
use crate::error::{Result, ShmError};
use crate::layout::WordState;
use crate::lifecycle::{self, PeerEvent};
use crate::region::ShmRegion;
use crate::rendezvous::{cancel_wait, Gate, WriterSide};
use crate::word::{WaitKey, WordId};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Status {
    Open,
    /// `end()` was called; pending batches still drain.
    Ending,
    Ended,
    Destroyed(ShmError),
}

/// What a [`WriteFuture`] resolves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Until {
    Acked(u64),
    Ended,
}

enum Progress {
    /// Nothing left that a word change could unblock.
    Stalled,
    Wait(WordId, WordState),
}

struct WriterState {
    queue: WriteQueue,
    corked: u32,
    acked: u64,
    in_flight: Option<u64>,
    status: Status,
    /// Registration of the pump on a control word.
    pump_slot: Option<WaitKey>,
    followers: Vec<Waker>,
}

impl WriterState {
    fn wake_followers(&mut self) {
        for waker in self.followers.drain(..) {
            waker.wake();
        }
    }

    fn follow(&mut self, waker: &Waker) {
        if !self.followers.iter().any(|w| w.will_wake(waker)) {
            self.followers.push(waker.clone());
        }
    }

    /// Open, nothing queued for publication and the pump is not parked.
    fn is_stalled(&self) -> bool {
        self.status == Status::Open
            && self.pump_slot.is_none()
            && self.in_flight.is_none()
            && !self.queue.has_sealed()
    }

    fn outcome(&self, until: Until) -> Option<Result<()>> {
        if let Until::Acked(seq) = until {
            if self.acked >= seq {
                return Some(Ok(()));
            }
        }
        match &self.status {
            Status::Destroyed(err) => Some(Err(err.clone())),
            Status::Ended => Some(Ok(())),
            Status::Open | Status::Ending => None,
        }
    }
}

struct WriterCore {
    side: WriterSide,
    state: Mutex<WriterState>,
    /// A pump run was requested while the state lock was taken.
    pump_requested: AtomicBool,
}

/// Guard over [`WriterState`] that runs a deferred pump on release.
struct Locked<'a> {
    core: &'a Arc<WriterCore>,
    guard: ManuallyDrop<MutexGuard<'a, WriterState>>,
}

impl Deref for Locked<'_> {
    type Target = WriterState;

    fn deref(&self) -> &WriterState {
        &self.guard
    }
}

impl DerefMut for Locked<'_> {
    fn deref_mut(&mut self) -> &mut WriterState {
        &mut self.guard
    }
}

impl Drop for Locked<'_> {
    fn drop(&mut self) {
        // SAFETY: `guard` is not touched again after this.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        if self.core.pump_requested.load(Ordering::SeqCst) {
            self.core.pump();
        }
    }
}

/// Waker for a thread blocked in [`WriterCore::block_until`].
struct Unpark(Thread);

impl Wake for Unpark {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }
}

/// Waker that runs the pump of the writer it belongs to.
struct Pump(Arc<WriterCore>);

impl Wake for Pump {
    fn wake(self: Arc<Self>) {
        self.0.pump();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.pump();
    }
}

impl WriterCore {
    fn lock<'a>(self: &'a Arc<Self>) -> Locked<'a> {
        let guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Locked {
            core: self,
            guard: ManuallyDrop::new(guard),
        }
    }

    fn region(&self) -> &ShmRegion {
        self.side.region()
    }

    /// Terminal failure: drop queued data, close the writer word.
    fn fail(&self, st: &mut WriterState, err: ShmError) {
        if matches!(st.status, Status::Destroyed(_) | Status::Ended) {
            return;
        }
        let dropped = st.queue.clear();
        tracing::warn!(error = %err, dropped, "writer destroyed");
        st.status = Status::Destroyed(err);
        st.in_flight = None;
        cancel_wait(self.region(), &mut st.pump_slot);
        self.side.close();
        st.wake_followers();
    }

    /// Publish sealed batches and collect acknowledgments until a word change
    /// is needed. Closes the writer word once an `end()` drained everything.
    fn advance(&self, st: &mut WriterState) -> Progress {
        loop {
            if matches!(st.status, Status::Destroyed(_) | Status::Ended) {
                return Progress::Stalled;
            }

            if let Some(seq) = st.in_flight {
                match self.side.ack_gate() {
                    Gate::Open(Ok(())) => {
                        st.acked = seq;
                        st.in_flight = None;
                        st.wake_followers();
                        continue;
                    }
                    Gate::Open(Err(err)) => {
                        self.fail(st, err);
                        return Progress::Stalled;
                    }
                    Gate::Wait(id, state) => return Progress::Wait(id, state),
                }
            }

            if st.queue.has_sealed() {
                match self.side.demand_gate() {
                    Gate::Open(Ok(())) => {
                        let Some(batch) = st.queue.pop_sealed() else {
                            continue;
                        };
                        match self.side.publish(&batch.chunks) {
                            Ok(_) => st.in_flight = Some(batch.seq),
                            Err(err) => {
                                self.fail(st, err);
                                return Progress::Stalled;
                            }
                        }
                        continue;
                    }
                    Gate::Open(Err(err)) => {
                        self.fail(st, err);
                        return Progress::Stalled;
                    }
                    Gate::Wait(id, state) => return Progress::Wait(id, state),
                }
            }

            if st.status == Status::Ending && st.queue.is_empty() {
                self.side.close();
                st.status = Status::Ended;
                st.wake_followers();
                tracing::debug!(acked = st.acked, "writer ended");
            }
            return Progress::Stalled;
        }
    }

    /// Advance without blocking and park the pump on the word that blocks.
    ///
    /// Re-entrant wakeups while the state lock is held are folded into one
    /// more run by whoever releases the lock.
    fn pump(self: &Arc<Self>) {
        self.pump_requested.store(true, Ordering::SeqCst);
        loop {
            let mut st = match self.state.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            };
            if !self.pump_requested.swap(false, Ordering::SeqCst) {
                return;
            }
            self.pump_locked(&mut st);
            drop(st);
            if !self.pump_requested.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    fn pump_locked(self: &Arc<Self>, st: &mut WriterState) {
        loop {
            match self.advance(st) {
                Progress::Stalled => {
                    cancel_wait(self.region(), &mut st.pump_slot);
                    return;
                }
                Progress::Wait(id, state) => {
                    if st.pump_slot.is_some_and(|k| k.word != id) {
                        cancel_wait(self.region(), &mut st.pump_slot);
                    }
                    let waker = Waker::from(Arc::new(Pump(self.clone())));
                    let mut cx = Context::from_waker(&waker);
                    match self
                        .region()
                        .word(id)
                        .poll_wait(&mut cx, state, &mut st.pump_slot)
                    {
                        Poll::Ready(_) => continue,
                        Poll::Pending => return,
                    }
                }
            }
        }
    }

    /// Park the calling thread until `until` is decided.
    fn block_until(self: &Arc<Self>, until: Until) -> Result<()> {
        let waker = Waker::from(Arc::new(Unpark(thread::current())));
        self.pump();
        loop {
            {
                let mut st = self.lock();
                if let Some(res) = st.outcome(until) {
                    return res;
                }
                if st.is_stalled() {
                    return Err(ShmError::Io("writer stalled with nothing to publish".into()));
                }
                st.follow(&waker);
            }
            thread::park();
        }
    }
}

/// Writable end of a channel.
pub struct ShmWriter {
    core: Arc<WriterCore>,
}

impl ShmWriter {
    /// Attach the writer to `region` with default buffering.
    pub fn new(region: ShmRegion) -> Result<Self> {
        Self::with_config(region, &ChannelConfig::default())
    }

    pub fn with_config(region: ShmRegion, config: &ChannelConfig) -> Result<Self> {
        region.attach(WordId::Writer)?;
        region.writer_word().store(WordState::Idle);
        Ok(Self {
            core: Arc::new(WriterCore {
                side: WriterSide::new(region),
                state: Mutex::new(WriterState {
                    queue: WriteQueue::new(config.writer_high_water_mark),
                    corked: 0,
                    acked: 0,
                    in_flight: None,
                    status: Status::Open,
                    pump_slot: None,
                    followers: Vec::new(),
                }),
                pump_requested: AtomicBool::new(false),
            }),
        })
    }

    pub fn region(&self) -> &ShmRegion {
        self.core.region()
    }

    /// Queue one chunk. The future resolves once its batch is acknowledged.
    ///
    /// An uncorked chunk is published as soon as the reader asks for data,
    /// whether or not the future is polled. While corked, the chunk joins the
    /// open batch and goes out with the matching `uncork`.
    pub fn write(&self, chunk: impl Into<Bytes>) -> WriteFuture {
        self.writev([chunk.into()])
    }

    /// Queue several chunks as one batch.
    pub fn writev<I, B>(&self, chunks: I) -> WriteFuture
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let chunks: Vec<Bytes> = chunks.into_iter().map(Into::into).collect();
        let target = {
            let mut st = self.core.lock();
            if st.status != Status::Open {
                return WriteFuture::ready(&self.core, Err(ShmError::Closed));
            }
            if chunks.is_empty() {
                return WriteFuture::ready(&self.core, Ok(()));
            }
            if st.corked > 0 {
                return WriteFuture::new(&self.core, Until::Acked(st.queue.push_open(chunks)));
            }
            st.queue.push_batch(chunks)
        };
        self.core.pump();
        WriteFuture::new(&self.core, Until::Acked(target))
    }

    /// Start collecting writes into one batch. Calls nest.
    pub fn cork(&self) {
        let mut st = self.core.lock();
        if st.status == Status::Open {
            st.corked += 1;
        }
    }

    /// Undo one `cork`. The last one publishes the collected batch.
    pub fn uncork(&self) -> WriteFuture {
        let (target, sealed) = {
            let mut st = self.core.lock();
            if st.corked == 0 {
                return WriteFuture::ready(&self.core, Ok(()));
            }
            st.corked -= 1;
            let sealed = st.corked == 0;
            if sealed {
                st.queue.seal_open();
            }
            (st.queue.last_seq(), sealed)
        };
        if sealed {
            self.core.pump();
        }
        WriteFuture::new(&self.core, Until::Acked(target))
    }

    pub fn corked(&self) -> u32 {
        self.core.lock().corked
    }

    /// Publish everything queued, corked or not, and wait for acknowledgment.
    pub fn flush(&self) -> WriteFuture {
        let target = {
            let mut st = self.core.lock();
            st.queue.seal_open();
            st.queue.last_seq()
        };
        self.core.pump();
        WriteFuture::new(&self.core, Until::Acked(target))
    }

    /// Publish everything queued, blocking the calling thread until the reader
    /// has acknowledged every batch.
    ///
    /// Safe to call while [`WriteFuture`]s are pending. There is no timeout: a
    /// reader that never asks for data blocks this call forever.
    pub fn flush_sync(&self) -> Result<()> {
        let target = {
            let mut st = self.core.lock();
            st.queue.seal_open();
            st.queue.last_seq()
        };
        tracing::trace!(target, "synchronous flush");
        self.core.block_until(Until::Acked(target))
    }

    /// Flush everything queued, then close the channel.
    ///
    /// The word is closed as soon as the queue drains, even if the returned
    /// future is dropped.
    pub fn end(&self) -> WriteFuture {
        {
            let mut st = self.core.lock();
            if let Status::Destroyed(err) = &st.status {
                return WriteFuture::ready(&self.core, Err(err.clone()));
            }
            if st.status == Status::Open {
                st.status = Status::Ending;
                st.queue.seal_open();
            }
        }
        self.core.pump();
        WriteFuture::new(&self.core, Until::Ended)
    }

    /// Write a final chunk, then end.
    pub fn end_with(&self, chunk: impl Into<Bytes>) -> WriteFuture {
        // The chunk's own future is subsumed by the end future.
        drop(self.write(chunk));
        self.end()
    }

    /// Abort the channel immediately. Queued chunks are dropped and pending
    /// writes fail with `err` (or [`ShmError::Destroyed`]).
    pub fn destroy(&self, err: Option<ShmError>) {
        let err = err.unwrap_or_else(|| ShmError::Destroyed("writer destroyed".into()));
        let mut st = self.core.lock();
        self.core.fail(&mut st, err);
    }

    /// Whether further writes are refused.
    pub fn is_closed(&self) -> bool {
        self.core.lock().status != Status::Open
    }

    pub fn is_ended(&self) -> bool {
        self.core.lock().status == Status::Ended
    }

    /// Terminal error, if the writer was destroyed.
    pub fn error(&self) -> Option<ShmError> {
        match &self.core.lock().status {
            Status::Destroyed(err) => Some(err.clone()),
            _ => None,
        }
    }

    /// Whether queued data reached the high-water mark.
    pub fn needs_drain(&self) -> bool {
        self.core.lock().queue.needs_drain()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.core.lock().queue.buffered_bytes()
    }
}

impl Drop for ShmWriter {
    fn drop(&mut self) {
        let mut st = self.core.lock();
        if st.status == Status::Ending {
            // The pump keeps the core alive and closes the word once drained.
            drop(st);
            self.core.pump();
            return;
        }
        if st.status != Status::Open {
            return;
        }

        // Dropped without end(): unsent batches are discarded and the reader
        // must not mistake this for a clean close.
        let dropped = st.queue.clear();
        st.status = Status::Destroyed(ShmError::Destroyed("writer dropped before end".into()));
        cancel_wait(self.core.region(), &mut st.pump_slot);
        st.wake_followers();
        drop(st);
        tracing::debug!(dropped, "writer dropped before end");

        if lifecycle::is_managed_thread() {
            return;
        }
        let event = if std::thread::panicking() {
            PeerEvent::Failed("writer dropped while panicking".into())
        } else {
            PeerEvent::Exited
        };
        self.core.region().report_peer(event);
    }
}

impl std::fmt::Debug for ShmWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.core.lock();
        f.debug_struct("ShmWriter")
            .field("status", &st.status)
            .field("corked", &st.corked)
            .field("acked", &st.acked)
            .field("in_flight", &st.in_flight)
            .finish()
    }
}

/// Completion of a write, uncork, flush or end.
///
/// Dropping it does not cancel anything; it only stops observing.
#[must_use = "dropping the future discards the write's outcome"]
pub struct WriteFuture {
    core: Arc<WriterCore>,
    until: Until,
    ready: Option<Result<()>>,
}

impl WriteFuture {
    fn new(core: &Arc<WriterCore>, until: Until) -> Self {
        Self {
            core: core.clone(),
            until,
            ready: None,
        }
    }

    fn ready(core: &Arc<WriterCore>, res: Result<()>) -> Self {
        Self {
            core: core.clone(),
            until: Until::Acked(0),
            ready: Some(res),
        }
    }

    /// Block the calling thread until the future resolves.
    ///
    /// A write still sitting in a corked batch is sealed and published, like
    /// `flush_sync` would.
    pub fn wait(mut self) -> Result<()> {
        if let Some(res) = self.ready.take() {
            return res;
        }
        if let Until::Acked(seq) = self.until {
            let mut st = self.core.lock();
            if st.queue.has_open() && seq == st.queue.last_seq() {
                st.queue.seal_open();
            }
        }
        self.core.block_until(self.until)
    }
}

impl Future for WriteFuture {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        if let Some(res) = this.ready.take() {
            return Poll::Ready(res);
        }
        let mut st = this.core.lock();
        match st.outcome(this.until) {
            Some(res) => Poll::Ready(res),
            None => {
                st.follow(cx.waker());
                Poll::Pending
            }
        }
    }
}

impl std::fmt::Debug for WriteFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteFuture")
            .field("until", &self.until)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::rendezvous::{Consumed, ReaderSide};

    fn attached(len: usize) -> (ShmWriter, ReaderSide) {
        let region = ShmRegion::new(len).unwrap();
        let writer = ShmWriter::new(region.clone()).unwrap();
        (writer, ReaderSide::new(region))
    }

    #[test]
    fn queued_batch_goes_out_when_demand_arrives() {
        let (writer, reader) = attached(256);
        let _pending = writer.write("early");
        assert_eq!(reader.region().writer_word().load(), WordState::Idle);
        assert_eq!(reader.region().reader_word().waiters(), 1);

        reader.request_read();
        assert_eq!(reader.region().writer_word().load(), WordState::Signaled);
        let consumed = reader.consume(|_| false).unwrap();
        assert_eq!(consumed, Consumed::Batch { chunks: 1, more: false });
        assert_eq!(writer.core.lock().acked, 1);
        assert_eq!(reader.region().writer_word().waiters(), 0);
    }

    #[test]
    fn flush_publishes_a_corked_batch() {
        let (writer, reader) = attached(256);
        writer.cork();
        let _a = writer.write("a");
        reader.request_read();
        assert_eq!(reader.region().writer_word().load(), WordState::Idle);

        let _flushed = writer.flush();
        assert_eq!(reader.region().writer_word().load(), WordState::Signaled);
        assert_eq!(writer.corked(), 1);
    }

    #[test]
    fn wait_seals_a_corked_write_and_blocks_until_acked() {
        let (writer, reader) = attached(256);
        let producer = std::thread::spawn(move || {
            writer.cork();
            writer.write("w").wait()
        });

        reader.request_read();
        reader.wait_batch().unwrap();
        let mut got = Vec::new();
        reader
            .consume(|chunk| {
                got.push(chunk);
                true
            })
            .unwrap();
        assert_eq!(got, vec![Bytes::from_static(b"w")]);
        assert_eq!(producer.join().unwrap(), Ok(()));
    }

    #[test]
    fn end_without_pending_data_closes_at_once() {
        let (writer, reader) = attached(256);
        drop(writer.end());
        assert!(writer.is_ended());
        assert_eq!(reader.region().writer_word().load(), WordState::Closed);
    }

    #[test]
    fn dropped_open_writer_releases_its_registration() {
        let (writer, reader) = attached(256);
        drop(writer.write("never sent"));
        assert_eq!(reader.region().reader_word().waiters(), 1);
        drop(writer);
        assert_eq!(reader.region().reader_word().waiters(), 0);
        assert_eq!(reader.region().peer_event(), Some(PeerEvent::Exited));
    }
}
