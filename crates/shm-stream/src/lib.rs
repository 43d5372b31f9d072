//! Chunked byte streams between two threads over a shared memory region.
//!
//! A channel is one [`ShmRegion`] holding two control words and a data area.
//! The [`ShmWriter`] publishes batches of chunks into the data area only after
//! the [`ShmReader`] asked for one, and waits for the reader to acknowledge a
//! batch before reusing the area. See [`rendezvous`] for the handshake and
//! [`layout`] for the memory layout.

pub mod buffer;
pub mod codec;
pub mod config;
pub mod error;
pub mod layout;
pub mod lifecycle;
pub mod reader;
pub mod region;
pub mod rendezvous;
pub mod word;
pub mod writer;

pub use crate::config::ChannelConfig;
pub use crate::error::{Result, ShmError};
pub use crate::layout::{RegionLayout, WordState};
pub use crate::lifecycle::{spawn_peer, PeerEvent, PeerHandle};
pub use crate::reader::ShmReader;
pub use crate::region::ShmRegion;
pub use crate::word::{ControlWord, WaitOutcome, WordId};
pub use crate::writer::{ShmWriter, WriteFuture};

/// Allocate a region for `config` and attach both ends to it.
pub fn channel(config: &ChannelConfig) -> Result<(ShmWriter, ShmReader)> {
    let region = ShmRegion::from_config(config)?;
    let writer = ShmWriter::with_config(region.clone(), config)?;
    let reader = ShmReader::with_config(region, config)?;
    Ok((writer, reader))
}
