//! Consumer-facing adapter.
//!
//! The reader asks for a batch only when its local buffer is empty, keeps
//! asking while the buffer stays under its high-water mark, and hands chunks
//! out one at a time. Chunks already buffered or already published are always
//! delivered before a peer failure is reported.

use std::mem;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::stream::Stream;

use crate::buffer::ReadBuffer;
use crate::config::ChannelConfig;
use crate::error::{Result, ShmError};
use crate::layout::WordState;
use crate::region::ShmRegion;
use crate::rendezvous::{cancel_wait, Consumed, Gate, ReaderSide};
use crate::word::{WaitKey, WordId};

#[derive(Debug)]
enum ReadState {
    Open,
    Ended,
    /// Reported once, then `Done`.
    Failed(ShmError),
    Done,
}

enum Pull {
    Chunk(Bytes),
    End,
    Error(ShmError),
    Wait(WordId, WordState),
}

/// Readable end of a channel.
pub struct ShmReader {
    side: ReaderSide,
    buffer: ReadBuffer,
    /// Demand is currently announced on the reader word.
    armed: bool,
    state: ReadState,
    slot: Option<WaitKey>,
    closed: bool,
}

impl ShmReader {
    /// Attach the reader to `region` with default buffering.
    pub fn new(region: ShmRegion) -> Result<Self> {
        Self::with_config(region, &ChannelConfig::default())
    }

    pub fn with_config(region: ShmRegion, config: &ChannelConfig) -> Result<Self> {
        region.attach(WordId::Reader)?;
        region.reader_word().store(WordState::Idle);
        Ok(Self {
            side: ReaderSide::new(region),
            buffer: ReadBuffer::new(config.reader_high_water_mark),
            armed: false,
            state: ReadState::Open,
            slot: None,
            closed: false,
        })
    }

    pub fn region(&self) -> &ShmRegion {
        self.side.region()
    }

    fn fail(&mut self, err: ShmError) {
        tracing::warn!(error = %err, buffered = self.buffer.len(), "reader failed");
        self.state = ReadState::Failed(err);
        self.armed = false;
    }

    fn step(&mut self) -> Pull {
        loop {
            if let Some(chunk) = self.buffer.pop() {
                return Pull::Chunk(chunk);
            }
            match mem::replace(&mut self.state, ReadState::Done) {
                ReadState::Open => self.state = ReadState::Open,
                ReadState::Failed(err) => return Pull::Error(err),
                ended @ (ReadState::Ended | ReadState::Done) => {
                    self.state = ended;
                    return Pull::End;
                }
            }

            if !self.armed {
                self.side.request_read();
                self.armed = true;
            }

            match self.side.batch_gate() {
                Gate::Wait(id, state) => return Pull::Wait(id, state),
                Gate::Open(Err(err)) => {
                    self.fail(err);
                    continue;
                }
                Gate::Open(Ok(())) => {}
            }

            let buffer = &mut self.buffer;
            match self.side.consume(|chunk| buffer.push(chunk)) {
                Ok(Consumed::Nothing) => {}
                Ok(Consumed::Batch { more, .. }) => self.armed = more,
                Ok(Consumed::End) => {
                    self.state = ReadState::Ended;
                    self.armed = false;
                }
                Err(err) => self.fail(err),
            }
        }
    }

    /// Next chunk, blocking the calling thread until one is available.
    ///
    /// Returns `Ok(None)` once the writer ended the channel. A failure is
    /// reported once; later calls return `Ok(None)`.
    pub fn read(&mut self) -> Result<Option<Bytes>> {
        cancel_wait(self.side.region(), &mut self.slot);
        loop {
            match self.step() {
                Pull::Chunk(chunk) => return Ok(Some(chunk)),
                Pull::End => return Ok(None),
                Pull::Error(err) => return Err(err),
                Pull::Wait(id, state) => {
                    self.side.region().word(id).wait(state);
                }
            }
        }
    }

    /// Task-based form of [`ShmReader::read`].
    pub fn poll_read(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes>>> {
        loop {
            let pull = self.step();
            let region = self.side.region();
            match pull {
                Pull::Wait(id, state) => {
                    if self.slot.is_some_and(|k| k.word != id) {
                        cancel_wait(region, &mut self.slot);
                    }
                    match region.word(id).poll_wait(cx, state, &mut self.slot) {
                        Poll::Ready(_) => continue,
                        Poll::Pending => return Poll::Pending,
                    }
                }
                done => {
                    cancel_wait(region, &mut self.slot);
                    return Poll::Ready(match done {
                        Pull::Chunk(chunk) => Some(Ok(chunk)),
                        Pull::Error(err) => Some(Err(err)),
                        _ => None,
                    });
                }
            }
        }
    }

    /// Drop buffered chunks and close the reader word. A writer still waiting
    /// for demand fails with [`ShmError::PrematureClose`].
    pub fn destroy(&mut self) {
        cancel_wait(self.side.region(), &mut self.slot);
        self.buffer.clear();
        self.state = ReadState::Done;
        self.armed = false;
        self.close();
    }

    fn close(&mut self) {
        if !mem::replace(&mut self.closed, true) {
            self.side.close();
        }
    }

    /// Whether the writer ended the channel and every chunk was handed out.
    pub fn is_ended(&self) -> bool {
        self.buffer.is_empty() && matches!(self.state, ReadState::Ended | ReadState::Done)
    }

    pub fn buffered_chunks(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.buffered_bytes()
    }
}

impl Iterator for ShmReader {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Result<Bytes>> {
        self.read().transpose()
    }
}

impl Stream for ShmReader {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes>>> {
        self.get_mut().poll_read(cx)
    }
}

impl Drop for ShmReader {
    fn drop(&mut self) {
        cancel_wait(self.side.region(), &mut self.slot);
        self.close();
    }
}

impl std::fmt::Debug for ShmReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmReader")
            .field("state", &self.state)
            .field("armed", &self.armed)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::rendezvous::WriterSide;
    use futures_util::task::noop_waker;

    fn attached(len: usize) -> (ShmReader, WriterSide) {
        let region = ShmRegion::new(len).unwrap();
        let reader = ShmReader::new(region.clone()).unwrap();
        (reader, WriterSide::new(region))
    }

    #[test]
    fn poll_read_arms_demand_and_parks() {
        let (mut reader, writer) = attached(256);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        assert!(reader.poll_read(&mut cx).is_pending());
        assert_eq!(writer.region().reader_word().load(), WordState::Signaled);
        assert_eq!(writer.region().writer_word().waiters(), 1);

        writer.publish(&[b"a", b"b"]).unwrap();
        assert!(matches!(reader.poll_read(&mut cx), Poll::Ready(Some(Ok(c))) if c == "a"));
        assert_eq!(writer.region().writer_word().waiters(), 0);
        assert!(matches!(reader.poll_read(&mut cx), Poll::Ready(Some(Ok(c))) if c == "b"));
    }

    #[test]
    fn buffered_chunks_come_before_peer_failure() {
        let (mut reader, writer) = attached(256);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(reader.poll_read(&mut cx).is_pending());

        writer.publish(&[b"kept"]).unwrap();
        writer
            .region()
            .report_peer(crate::lifecycle::PeerEvent::Failed("gone".into()));

        assert_eq!(reader.read().unwrap().as_deref(), Some(&b"kept"[..]));
        assert_eq!(reader.read(), Err(ShmError::PeerFailed("gone".into())));
        assert_eq!(reader.read(), Ok(None));
    }

    #[test]
    fn closed_writer_ends_the_stream() {
        let (mut reader, writer) = attached(256);
        writer.close();
        assert_eq!(reader.read(), Ok(None));
        assert!(reader.is_ended());
        assert!(reader.next().is_none());
    }

    #[test]
    fn destroy_closes_reader_word() {
        let (mut reader, writer) = attached(256);
        reader.destroy();
        assert_eq!(writer.region().reader_word().load(), WordState::Closed);
        assert!(matches!(
            writer.demand_gate(),
            Gate::Open(Err(ShmError::PrematureClose))
        ));
        assert_eq!(reader.read(), Ok(None));
    }

    #[test]
    fn small_high_water_mark_withdraws_demand() {
        let region = ShmRegion::new(256).unwrap();
        let config = ChannelConfig::default().with_reader_high_water_mark(2);
        let mut reader = ShmReader::with_config(region.clone(), &config).unwrap();
        let writer = WriterSide::new(region);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        assert!(reader.poll_read(&mut cx).is_pending());
        writer.publish(&[&b"xy"[..], &b"z"[..]]).unwrap();
        assert!(matches!(reader.poll_read(&mut cx), Poll::Ready(Some(Ok(_)))));
        // Two bytes were buffered: demand was withdrawn before the ack.
        assert_eq!(writer.region().reader_word().load(), WordState::Idle);
        assert_eq!(writer.region().writer_word().load(), WordState::Idle);
    }
}
