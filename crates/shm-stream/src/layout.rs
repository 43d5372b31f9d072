//! Shared memory layout contract for a shm-stream channel.
//!
//! A channel lives in one contiguous region that both threads can see:
//!
//! - reader control word: written by the consumer to request data
//! - writer control word: written by the producer to publish a batch (and to close)
//! - data area: the encoded chunk batch currently in flight
//!
//! Each control word gets its own cache line so the two hot atomics never
//! share one.

/// Cache line size assumed for control word isolation.
pub const CACHE_LINE_BYTES: usize = 64;

/// Byte offsets of every field in a region.
///
/// All offsets are from the start of the region.
pub struct RegionLayout;

impl RegionLayout {
    /// Bytes reserved per control word (word 0 significant, the rest is padding).
    pub const WORD_STRIDE: usize = CACHE_LINE_BYTES;

    pub const READER_WORD_OFFSET: usize = 0;
    pub const WRITER_WORD_OFFSET: usize = Self::READER_WORD_OFFSET + Self::WORD_STRIDE;

    /// First byte of the codec payload.
    pub const DATA_OFFSET: usize = Self::WRITER_WORD_OFFSET + Self::WORD_STRIDE;

    /// Smallest legal region: both control words and an empty data area.
    pub const MIN_BYTE_LENGTH: usize = Self::DATA_OFFSET;

    /// Alignment of the region allocation.
    pub const ALIGN: usize = CACHE_LINE_BYTES;

    /// Data area capacity for a region of `byte_length` bytes.
    pub const fn data_capacity(byte_length: usize) -> usize {
        byte_length.saturating_sub(Self::DATA_OFFSET)
    }

    /// Region byte length needed to hold `data_bytes` bytes of payload.
    pub const fn byte_length_for_data(data_bytes: usize) -> usize {
        Self::DATA_OFFSET + data_bytes
    }
}

/// State of a control word.
///
/// Both words share the same encoding. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WordState {
    Idle = 0,
    Signaled = 1,
    Closed = 2,
}

impl WordState {
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Decode a raw word. Unknown values are reported as `None`.
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(WordState::Idle),
            1 => Some(WordState::Signaled),
            2 => Some(WordState::Closed),
            _ => None,
        }
    }
}
