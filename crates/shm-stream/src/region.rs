//! The shared region backing one channel.
//!
//! The region is a single contiguous, cache-line aligned allocation laid out
//! per [`RegionLayout`]. A growable region reserves its maximum byte length up
//! front and only moves the visible length, so control word addresses never
//! change.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::ChannelConfig;
use crate::error::{Result, ShmError};
use crate::layout::RegionLayout;
use crate::lifecycle::PeerEvent;
use crate::word::{ControlWord, WaitQueue, WordId};

/// Handle to a shared region. Clones refer to the same memory.
#[derive(Clone)]
pub struct ShmRegion {
    inner: Arc<RegionInner>,
}

struct RegionInner {
    base: NonNull<u8>,
    reserved: usize,
    byte_length: AtomicUsize,

    reader_queue: WaitQueue,
    writer_queue: WaitQueue,
    interrupted: AtomicBool,
    peer_event: Mutex<Option<PeerEvent>>,

    reader_attached: AtomicBool,
    writer_attached: AtomicBool,
}

// The raw allocation is only touched through atomics (control words) or by the
// side that currently owns the data area.
unsafe impl Send for RegionInner {}
unsafe impl Sync for RegionInner {}

impl ShmRegion {
    /// Allocate a fixed-size region of `byte_length` bytes.
    pub fn new(byte_length: usize) -> Result<Self> {
        Self::allocate(byte_length, byte_length)
    }

    /// Allocate a region of `byte_length` bytes that may grow up to `max_byte_length`.
    pub fn with_max_byte_length(byte_length: usize, max_byte_length: usize) -> Result<Self> {
        if max_byte_length < byte_length {
            return Err(ShmError::Validation(format!(
                "max byte length {max_byte_length} is smaller than byte length {byte_length}"
            )));
        }
        Self::allocate(byte_length, max_byte_length)
    }

    pub fn from_config(config: &ChannelConfig) -> Result<Self> {
        config.validate()?;
        match config.max_byte_length {
            Some(max) => Self::with_max_byte_length(config.byte_length, max),
            None => Self::new(config.byte_length),
        }
    }

    fn allocate(byte_length: usize, reserved: usize) -> Result<Self> {
        if byte_length < RegionLayout::MIN_BYTE_LENGTH {
            return Err(ShmError::Validation(format!(
                "region must be at least {} bytes, got {byte_length}",
                RegionLayout::MIN_BYTE_LENGTH
            )));
        }
        let layout = Layout::from_size_align(reserved, RegionLayout::ALIGN)
            .map_err(|err| ShmError::Validation(format!("bad region size {reserved}: {err}")))?;

        // Zeroed memory leaves both control words `Idle`.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let Some(base) = NonNull::new(ptr) else {
            alloc::handle_alloc_error(layout);
        };

        tracing::debug!(byte_length, reserved, "allocated shared region");

        Ok(Self {
            inner: Arc::new(RegionInner {
                base,
                reserved,
                byte_length: AtomicUsize::new(byte_length),
                reader_queue: WaitQueue::new(),
                writer_queue: WaitQueue::new(),
                interrupted: AtomicBool::new(false),
                peer_event: Mutex::new(None),
                reader_attached: AtomicBool::new(false),
                writer_attached: AtomicBool::new(false),
            }),
        })
    }

    pub fn byte_length(&self) -> usize {
        self.inner.byte_length.load(Ordering::SeqCst)
    }

    pub fn max_byte_length(&self) -> usize {
        self.inner.reserved
    }

    pub fn is_growable(&self) -> bool {
        self.byte_length() < self.inner.reserved
    }

    /// Current data area capacity in bytes.
    pub fn data_capacity(&self) -> usize {
        RegionLayout::data_capacity(self.byte_length())
    }

    pub fn reader_word(&self) -> ControlWord<'_> {
        self.word(WordId::Reader)
    }

    pub fn writer_word(&self) -> ControlWord<'_> {
        self.word(WordId::Writer)
    }

    pub fn word(&self, id: WordId) -> ControlWord<'_> {
        let (offset, queue) = match id {
            WordId::Reader => (RegionLayout::READER_WORD_OFFSET, &self.inner.reader_queue),
            WordId::Writer => (RegionLayout::WRITER_WORD_OFFSET, &self.inner.writer_queue),
        };
        // Both offsets are 64-byte aligned inside a 64-byte aligned allocation
        // of at least `MIN_BYTE_LENGTH` bytes.
        let atom = unsafe { &*(self.inner.base.as_ptr().add(offset) as *const AtomicU32) };
        ControlWord::new(id, atom, queue, &self.inner.interrupted)
    }

    /// Make sure the data area can hold `needed` bytes, growing if allowed.
    ///
    /// Only the writer calls this, and only while it owns the data area.
    pub(crate) fn ensure_data_capacity(&self, needed: usize) -> Result<()> {
        let capacity = self.data_capacity();
        if needed <= capacity {
            return Ok(());
        }

        let max_capacity = RegionLayout::data_capacity(self.inner.reserved);
        if needed > max_capacity {
            return Err(ShmError::Capacity {
                needed,
                capacity: max_capacity,
            });
        }

        let new_len = RegionLayout::byte_length_for_data(needed)
            .checked_next_power_of_two()
            .unwrap_or(self.inner.reserved)
            .min(self.inner.reserved);
        self.inner.byte_length.store(new_len, Ordering::SeqCst);
        tracing::debug!(
            old = capacity,
            new = RegionLayout::data_capacity(new_len),
            "grew shared region data area"
        );
        Ok(())
    }

    /// Mutable view of the data area.
    ///
    /// # Safety
    ///
    /// The caller must own the data area: it is the writer and the writer word
    /// is not `Signaled`. No other view of the data area may be alive.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn data_area_mut(&self) -> &mut [u8] {
        let len = self.data_capacity();
        std::slice::from_raw_parts_mut(
            self.inner.base.as_ptr().add(RegionLayout::DATA_OFFSET),
            len,
        )
    }

    /// Shared view of the data area.
    ///
    /// # Safety
    ///
    /// The caller must own the data area: it is the reader and it observed the
    /// writer word `Signaled` and has not released it yet.
    pub(crate) unsafe fn data_area(&self) -> &[u8] {
        let len = self.data_capacity();
        std::slice::from_raw_parts(self.inner.base.as_ptr().add(RegionLayout::DATA_OFFSET), len)
    }

    /// Claim one side of the channel. Each side can be claimed once.
    pub(crate) fn attach(&self, id: WordId) -> Result<()> {
        let flag = match id {
            WordId::Reader => &self.inner.reader_attached,
            WordId::Writer => &self.inner.writer_attached,
        };
        if flag.swap(true, Ordering::SeqCst) {
            return Err(ShmError::Validation(format!(
                "region already has a {} attached",
                match id {
                    WordId::Reader => "reader",
                    WordId::Writer => "writer",
                }
            )));
        }
        Ok(())
    }

    /// Record a peer lifecycle event and release every waiter on both words.
    ///
    /// The first event wins, except that a failure replaces a plain exit.
    pub fn report_peer(&self, event: PeerEvent) {
        {
            let mut slot = self
                .inner
                .peer_event
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match (&*slot, &event) {
                (None, _) | (Some(PeerEvent::Exited), PeerEvent::Failed(_)) => {
                    *slot = Some(event.clone());
                }
                _ => return,
            }
        }
        tracing::debug!(?event, "peer lifecycle event");

        self.inner.interrupted.store(true, Ordering::SeqCst);
        self.reader_word().notify_all();
        self.writer_word().notify_all();
    }

    pub fn peer_event(&self) -> Option<PeerEvent> {
        self.inner
            .peer_event
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for RegionInner {
    fn drop(&mut self) {
        if let Ok(layout) = Layout::from_size_align(self.reserved, RegionLayout::ALIGN) {
            unsafe { alloc::dealloc(self.base.as_ptr(), layout) };
        }
    }
}

impl fmt::Debug for ShmRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmRegion")
            .field("byte_length", &self.byte_length())
            .field("max_byte_length", &self.max_byte_length())
            .field("reader", &self.reader_word().load())
            .field("writer", &self.writer_word().load())
            .finish()
    }
}
