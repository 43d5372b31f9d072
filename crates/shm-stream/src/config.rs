use crate::buffer::DEFAULT_HIGH_WATER_MARK;
use crate::error::{Result, ShmError};
use crate::layout::RegionLayout;

/// Default region size in bytes (control words included).
pub const DEFAULT_BYTE_LENGTH: usize = 1024;

/// Settings for a channel: region sizing plus stream-side buffering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Initial region size in bytes, control words included.
    pub byte_length: usize,

    /// Ceiling for region growth. `None` keeps the region fixed.
    pub max_byte_length: Option<usize>,

    /// Bytes the reader buffers locally before it stops requesting batches.
    pub reader_high_water_mark: usize,

    /// Queued bytes at which [`crate::ShmWriter::needs_drain`] turns true.
    pub writer_high_water_mark: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            byte_length: DEFAULT_BYTE_LENGTH,
            max_byte_length: None,
            reader_high_water_mark: DEFAULT_HIGH_WATER_MARK,
            writer_high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

impl ChannelConfig {
    pub fn with_byte_length(mut self, byte_length: usize) -> Self {
        self.byte_length = byte_length;
        self
    }

    pub fn with_max_byte_length(mut self, max_byte_length: usize) -> Self {
        self.max_byte_length = Some(max_byte_length);
        self
    }

    pub fn with_reader_high_water_mark(mut self, bytes: usize) -> Self {
        self.reader_high_water_mark = bytes;
        self
    }

    pub fn with_writer_high_water_mark(mut self, bytes: usize) -> Self {
        self.writer_high_water_mark = bytes;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.byte_length < RegionLayout::MIN_BYTE_LENGTH {
            return Err(ShmError::Validation(format!(
                "byte_length must be at least {} (got {})",
                RegionLayout::MIN_BYTE_LENGTH,
                self.byte_length
            )));
        }
        if let Some(max) = self.max_byte_length {
            if max < self.byte_length {
                return Err(ShmError::Validation(format!(
                    "max_byte_length ({max}) must not be below byte_length ({})",
                    self.byte_length
                )));
            }
        }
        if self.reader_high_water_mark == 0 {
            // A zero mark would pause the reader before it ever buffers a byte.
            return Err(ShmError::Validation(
                "reader_high_water_mark must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
