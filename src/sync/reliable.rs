//! Reliable command channel.
//!
//! Commands are numbered text strings. The sender keeps every command the
//! peer has not acknowledged in a fixed ring and repeats all of them in every
//! outgoing message until the acknowledge catches up. The receiver executes
//! each sequence exactly once, in order.

use tracing::warn;

use crate::core::{ChannelError, MAX_RELIABLE_COMMANDS};

const MASK: i32 = MAX_RELIABLE_COMMANDS as i32 - 1;

fn slot(sequence: i32) -> usize {
    (sequence & MASK) as usize
}

/// Outgoing side: a ring of unacknowledged commands.
#[derive(Debug, Clone)]
pub struct ReliableRing {
    commands: Vec<String>,
    /// Sequence of the newest command.
    sequence: i32,
    /// Highest sequence the peer has acknowledged.
    acknowledged: i32,
}

impl Default for ReliableRing {
    fn default() -> Self {
        Self::new()
    }
}

impl ReliableRing {
    /// Create an empty ring.
    pub fn new() -> Self {
        Self {
            commands: vec![String::new(); MAX_RELIABLE_COMMANDS],
            sequence: 0,
            acknowledged: 0,
        }
    }

    /// Sequence of the newest command.
    pub fn sequence(&self) -> i32 {
        self.sequence
    }

    /// Highest acknowledged sequence.
    pub fn acknowledged(&self) -> i32 {
        self.acknowledged
    }

    /// Commands sent but not acknowledged.
    pub fn unacked(&self) -> usize {
        self.sequence.wrapping_sub(self.acknowledged) as usize
    }

    /// Append a command, returning its sequence.
    ///
    /// Fails without side effects when the ring already holds
    /// `MAX_RELIABLE_COMMANDS` unacknowledged commands.
    pub fn push(&mut self, command: impl Into<String>) -> Result<i32, ChannelError> {
        let unacked = self.unacked();
        if unacked >= MAX_RELIABLE_COMMANDS {
            return Err(ChannelError::Overflow {
                unacked,
                capacity: MAX_RELIABLE_COMMANDS,
            });
        }
        self.sequence = self.sequence.wrapping_add(1);
        self.commands[slot(self.sequence)] = command.into();
        Ok(self.sequence)
    }

    /// Append a command, discarding the oldest unacknowledged one if full.
    ///
    /// Only used for the final notice on a connection being torn down.
    pub fn force_push(&mut self, command: impl Into<String>) -> i32 {
        if self.unacked() >= MAX_RELIABLE_COMMANDS {
            self.acknowledged = self.acknowledged.wrapping_add(1);
        }
        self.sequence = self.sequence.wrapping_add(1);
        self.commands[slot(self.sequence)] = command.into();
        self.sequence
    }

    /// Record the peer's acknowledge.
    ///
    /// An acknowledge ahead of the newest command is illegible. One more
    /// than a ring behind is clamped to the current sequence.
    pub fn acknowledge(&mut self, ack: i32) -> Result<(), ChannelError> {
        let behind = self.sequence.wrapping_sub(ack);
        if behind < 0 {
            return Err(ChannelError::IllegibleAck {
                ack,
                sequence: self.sequence,
            });
        }
        if behind > MAX_RELIABLE_COMMANDS as i32 {
            warn!(
                ack,
                sequence = self.sequence,
                "reliable acknowledge out of range, resetting"
            );
            self.acknowledged = self.sequence;
            return Ok(());
        }
        if ack.wrapping_sub(self.acknowledged) > 0 {
            self.acknowledged = ack;
        }
        Ok(())
    }

    /// Unacknowledged commands, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = (i32, &str)> {
        let first = self.acknowledged.wrapping_add(1);
        (0..self.unacked() as i32).map(move |i| {
            let seq = first.wrapping_add(i);
            (seq, self.commands[slot(seq)].as_str())
        })
    }

    /// Whatever the ring slot for `sequence` currently holds.
    pub fn slot_text(&self, sequence: i32) -> &str {
        &self.commands[slot(sequence)]
    }

    /// Forget everything.
    pub fn reset(&mut self) {
        self.commands.iter_mut().for_each(String::clear);
        self.sequence = 0;
        self.acknowledged = 0;
    }
}

/// What to do with an incoming command sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// Already executed; ignore.
    Duplicate,
    /// The next sequence; execute then [`commit`](InboundCommands::commit).
    Next,
}

/// Incoming side: tracks the last executed sequence and recent texts.
#[derive(Debug, Clone)]
pub struct InboundCommands {
    received: Vec<String>,
    last: i32,
}

impl Default for InboundCommands {
    fn default() -> Self {
        Self::new()
    }
}

impl InboundCommands {
    /// Create with nothing received.
    pub fn new() -> Self {
        Self {
            received: vec![String::new(); MAX_RELIABLE_COMMANDS],
            last: 0,
        }
    }

    /// Sequence of the last executed command.
    pub fn last(&self) -> i32 {
        self.last
    }

    /// Text of the last executed command.
    pub fn last_text(&self) -> &str {
        &self.received[slot(self.last)]
    }

    /// Text held for `sequence`, if it is recent enough to still be kept.
    pub fn get(&self, sequence: i32) -> Option<&str> {
        let age = self.last.wrapping_sub(sequence);
        if (0..MAX_RELIABLE_COMMANDS as i32).contains(&age) {
            Some(&self.received[slot(sequence)])
        } else {
            None
        }
    }

    /// Classify an incoming sequence. A gap is a protocol violation.
    pub fn classify(&self, sequence: i32) -> Result<Inbound, ChannelError> {
        let ahead = sequence.wrapping_sub(self.last);
        if ahead <= 0 {
            Ok(Inbound::Duplicate)
        } else if ahead > 1 {
            Err(ChannelError::LostCommands {
                expected: self.last.wrapping_add(1),
                actual: sequence,
            })
        } else {
            Ok(Inbound::Next)
        }
    }

    /// Mark `sequence` executed.
    pub fn commit(&mut self, sequence: i32, text: impl Into<String>) {
        self.last = sequence;
        self.received[slot(sequence)] = text.into();
    }

    /// Forget everything.
    pub fn reset(&mut self) {
        self.received.iter_mut().for_each(String::clear);
        self.last = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_until_acknowledged() {
        let mut ring = ReliableRing::new();
        assert_eq!(ring.push("a").unwrap(), 1);
        assert_eq!(ring.push("b").unwrap(), 2);
        assert_eq!(ring.pending().collect::<Vec<_>>(), vec![(1, "a"), (2, "b")]);

        ring.acknowledge(1).unwrap();
        assert_eq!(ring.pending().collect::<Vec<_>>(), vec![(2, "b")]);
        ring.acknowledge(2).unwrap();
        assert_eq!(ring.pending().count(), 0);
    }

    #[test]
    fn test_overflow_at_capacity() {
        let mut ring = ReliableRing::new();
        for i in 0..MAX_RELIABLE_COMMANDS {
            ring.push(format!("c{i}")).unwrap();
        }
        assert_eq!(
            ring.push("one too many"),
            Err(ChannelError::Overflow {
                unacked: MAX_RELIABLE_COMMANDS,
                capacity: MAX_RELIABLE_COMMANDS
            })
        );
        // The failed push left the ring untouched.
        assert_eq!(ring.sequence(), MAX_RELIABLE_COMMANDS as i32);
        assert_eq!(ring.slot_text(1), "c0");

        let seq = ring.force_push("disconnect");
        assert_eq!(seq, MAX_RELIABLE_COMMANDS as i32 + 1);
        assert_eq!(ring.unacked(), MAX_RELIABLE_COMMANDS);
    }

    #[test]
    fn test_illegible_ack() {
        let mut ring = ReliableRing::new();
        ring.push("a").unwrap();
        assert!(matches!(
            ring.acknowledge(5),
            Err(ChannelError::IllegibleAck { .. })
        ));
    }

    #[test]
    fn test_ack_never_moves_backwards() {
        let mut ring = ReliableRing::new();
        ring.push("a").unwrap();
        ring.push("b").unwrap();
        ring.acknowledge(2).unwrap();
        ring.acknowledge(1).unwrap();
        assert_eq!(ring.acknowledged(), 2);
    }

    #[test]
    fn test_inbound_exactly_once() {
        let mut inbound = InboundCommands::new();
        assert_eq!(inbound.classify(1), Ok(Inbound::Next));
        inbound.commit(1, "say hi");
        assert_eq!(inbound.classify(1), Ok(Inbound::Duplicate));
        assert_eq!(inbound.classify(0), Ok(Inbound::Duplicate));
        assert_eq!(
            inbound.classify(3),
            Err(ChannelError::LostCommands {
                expected: 2,
                actual: 3
            })
        );
        assert_eq!(inbound.last_text(), "say hi");
        assert_eq!(inbound.get(1), Some("say hi"));
        assert_eq!(inbound.get(2), None);
    }
}
