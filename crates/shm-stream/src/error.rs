use thiserror::Error;

use crate::codec::DecodeError;

pub type Result<T> = std::result::Result<T, ShmError>;

/// Errors surfaced by a shm-stream channel.
///
/// Terminal errors are stored by the adapters and handed out to every pending
/// operation, hence `Clone`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ShmError {
    /// The region or configuration cannot host a channel.
    #[error("invalid shared region: {0}")]
    Validation(String),

    #[error("batch needs {needed} bytes but the data area holds {capacity} bytes")]
    Capacity { needed: usize, capacity: usize },

    #[error("write after end")]
    Closed,

    /// The peer went away without closing its control word.
    #[error("premature close")]
    PrematureClose,

    #[error("peer failed: {0}")]
    PeerFailed(String),

    #[error("stream destroyed: {0}")]
    Destroyed(String),

    #[error("corrupt batch in data area: {0}")]
    Corrupt(#[from] DecodeError),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ShmError {
    fn from(err: std::io::Error) -> Self {
        ShmError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io;

    #[test]
    fn io_errors_keep_their_message() {
        let err: ShmError = io::Error::new(io::ErrorKind::Other, "no threads left").into();
        assert_eq!(err, ShmError::Io("no threads left".into()));
        assert_eq!(err.to_string(), "io error: no threads left");
    }
}
