//! Error types shared across layers.

use thiserror::Error;

use crate::sync::MessageError;
use crate::transport::TransportError;

/// Errors from the reliable command channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Enqueueing would overwrite a command the peer has not acknowledged.
    #[error("reliable command overflow: {unacked} unacknowledged (capacity {capacity})")]
    Overflow {
        /// Commands sent but not yet acknowledged.
        unacked: usize,
        /// Ring capacity.
        capacity: usize,
    },

    /// The peer skipped one or more command sequences.
    #[error("lost reliable commands: expected {expected}, got {actual}")]
    LostCommands {
        /// Next expected sequence.
        expected: i32,
        /// Sequence actually received.
        actual: i32,
    },

    /// The acknowledge is ahead of anything sent.
    #[error("illegible reliable acknowledge {ack} (sequence {sequence})")]
    IllegibleAck {
        /// Acknowledge received.
        ack: i32,
        /// Current send sequence.
        sequence: i32,
    },
}

/// Errors from snapshot storage and frame assembly.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    /// The arena cannot hold the current tick even after evicting every
    /// older frame. Indicates a misconfigured arena size.
    #[error("not enough snapshot storage: need {needed}, capacity {capacity}")]
    StorageExhausted {
        /// Entity records required by the current tick.
        needed: usize,
        /// Arena capacity.
        capacity: usize,
    },

    /// Visible entity ids were not strictly ascending after sorting.
    #[error("duplicate entity {0} in snapshot")]
    DuplicateEntity(u16),
}

/// Top-level host errors.
#[derive(Debug, Error)]
pub enum HostError {
    /// Snapshot error.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Message codec error.
    #[error("message error: {0}")]
    Message(#[from] MessageError),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostError {
    /// Errors that stop the tick loop rather than affecting one participant.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Snapshot(SnapshotError::StorageExhausted { .. }) | Self::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let storage = HostError::from(SnapshotError::StorageExhausted {
            needed: 10,
            capacity: 4,
        });
        assert!(storage.is_fatal());
        assert!(HostError::Config("bad".into()).is_fatal());
        assert!(!HostError::from(SnapshotError::DuplicateEntity(3)).is_fatal());
    }

    #[test]
    fn test_channel_error_display() {
        let err = ChannelError::LostCommands {
            expected: 5,
            actual: 7,
        };
        assert_eq!(err.to_string(), "lost reliable commands: expected 5, got 7");
    }
}
