//! Transport layer error types.
//!
//! Receive-side errors are dropped silently: a malformed or replayed packet
//! never produces a response.

use std::io;

use thiserror::Error;

use crate::sync::MessageError;

/// Transport layer errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Packet header could not be read.
    #[error("malformed packet: {0}")]
    Malformed(#[from] MessageError),

    /// I/O error (socket operations).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Connected-packet checksum did not match the challenge.
    #[error("bad packet checksum")]
    BadChecksum,

    /// Sequence at or below the last one received.
    #[error("out of order packet {sequence} (last {last})")]
    OutOfOrder {
        /// Sequence received.
        sequence: i32,
        /// Last sequence accepted.
        last: i32,
    },

    /// A fragment did not continue the message being reassembled.
    #[error("dropped a message fragment at {start} (have {have})")]
    FragmentGap {
        /// Fragment start offset.
        start: usize,
        /// Bytes reassembled so far.
        have: usize,
    },

    /// More fragments of the current message are pending.
    #[error("fragment incomplete")]
    Incomplete,

    /// Message exceeds the transport's maximum.
    #[error("message of {0} bytes exceeds maximum")]
    Oversize(usize),

    /// Nothing to send.
    #[error("transport idle")]
    Idle,
}

impl TransportError {
    /// Check if this error should result in silent drop (no response sent).
    pub fn is_silent_drop(&self) -> bool {
        matches!(
            self,
            TransportError::Malformed(_)
                | TransportError::BadChecksum
                | TransportError::OutOfOrder { .. }
                | TransportError::FragmentGap { .. }
                | TransportError::Incomplete
        )
    }

    /// Check if this error is fatal to the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Oversize(_))
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silent_drop_errors() {
        assert!(TransportError::BadChecksum.is_silent_drop());
        assert!(TransportError::OutOfOrder { sequence: 1, last: 2 }.is_silent_drop());
        assert!(TransportError::Incomplete.is_silent_drop());
        assert!(!TransportError::Oversize(20000).is_silent_drop());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(TransportError::Oversize(20000).is_fatal());
        assert!(!TransportError::BadChecksum.is_fatal());
    }
}
