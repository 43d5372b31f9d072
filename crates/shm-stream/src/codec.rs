//! In-place chunk batch codec.
//!
//! A batch is laid out as (all little-endian `u32`):
//!
//! - chunk count
//! - for each chunk: byte length, followed by the chunk bytes
//!
//! Framing is length-prefixed so any binary content, including empty chunks,
//! survives. There is no padding between records.

use bytes::Bytes;
use thiserror::Error;

use crate::error::{Result, ShmError};

/// Size of the batch count and of each chunk length prefix.
pub const PREFIX_BYTES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of data area")]
    UnexpectedEof,
    #[error("chunk count {0} cannot fit in the data area")]
    BogusCount(u32),
    #[error("chunk length {0} runs past the data area")]
    BogusLength(u32),
}

/// Serialized size of `chunks`.
pub fn encoded_len<B: AsRef<[u8]>>(chunks: &[B]) -> usize {
    chunks.iter().fold(PREFIX_BYTES, |acc, c| {
        acc.saturating_add(PREFIX_BYTES)
            .saturating_add(c.as_ref().len())
    })
}

/// Encode `chunks` into `buf` starting at `offset`. Returns the bytes written.
///
/// Nothing is written unless the whole batch fits.
pub fn encode<B: AsRef<[u8]>>(buf: &mut [u8], offset: usize, chunks: &[B]) -> Result<usize> {
    let needed = encoded_len(chunks);
    let capacity = buf.len().saturating_sub(offset);
    if needed > capacity {
        return Err(ShmError::Capacity { needed, capacity });
    }
    let count = u32::try_from(chunks.len()).map_err(|_| ShmError::Capacity {
        needed,
        capacity,
    })?;
    if chunks.iter().any(|c| c.as_ref().len() > u32::MAX as usize) {
        return Err(ShmError::Capacity { needed, capacity });
    }

    let mut pos = offset;
    write_u32_le(buf, &mut pos, count);
    for chunk in chunks {
        let chunk = chunk.as_ref();
        write_u32_le(buf, &mut pos, chunk.len() as u32);
        buf[pos..pos + chunk.len()].copy_from_slice(chunk);
        pos += chunk.len();
    }
    debug_assert_eq!(pos - offset, needed);
    Ok(needed)
}

/// Decode the batch at `offset` into freshly allocated chunks.
///
/// The returned chunks never borrow from `buf`.
pub fn decode(buf: &[u8], offset: usize) -> std::result::Result<Vec<Bytes>, DecodeError> {
    let mut pos = offset;
    let count = read_u32_le(buf, &mut pos)?;

    // Every chunk costs at least its length prefix.
    let remaining = buf.len().saturating_sub(pos);
    if (count as usize).saturating_mul(PREFIX_BYTES) > remaining {
        return Err(DecodeError::BogusCount(count));
    }

    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = read_u32_le(buf, &mut pos)?;
        let end = pos
            .checked_add(len as usize)
            .filter(|&end| end <= buf.len())
            .ok_or(DecodeError::BogusLength(len))?;
        out.push(Bytes::copy_from_slice(&buf[pos..end]));
        pos = end;
    }
    Ok(out)
}

fn read_u32_le(buf: &[u8], pos: &mut usize) -> std::result::Result<u32, DecodeError> {
    let end = pos.checked_add(4).ok_or(DecodeError::UnexpectedEof)?;
    let bytes = buf.get(*pos..end).ok_or(DecodeError::UnexpectedEof)?;
    *pos = end;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn write_u32_le(buf: &mut [u8], pos: &mut usize, v: u32) {
    buf[*pos..*pos + 4].copy_from_slice(&v.to_le_bytes());
    *pos += 4;
}
