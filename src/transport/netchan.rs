//! Sequenced packet channel with fragmentation.
//!
//! Wire format of a connected packet:
//! ```text
//! +0   Sequence (4 bytes LE32, bit 31 = fragment)
//! +4   Qport (2 bytes LE16, participant → host only)
//! ...  Checksum (4 bytes LE32, current protocol only)
//! ...  Fragment start (2 bytes LE16), fragment length (2 bytes LE16)
//! ...  Payload
//! ```
//! A fragment shorter than [`FRAGMENT_SIZE`] ends its message; a message
//! whose length is an exact multiple ends with an empty fragment.

use std::net::SocketAddr;

use tracing::debug;

use super::error::{TransportError, TransportResult};
use crate::core::{FRAGMENT_BIT, FRAGMENT_SIZE, MAX_MSG_LEN, MAX_PACKET_LEN};
use crate::sync::MessageReader;

/// A datagram addressed to or received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Peer address.
    pub addr: SocketAddr,
    /// Packet bytes.
    pub data: Vec<u8>,
}

impl Datagram {
    /// Create a datagram.
    pub fn new(addr: SocketAddr, data: Vec<u8>) -> Self {
        Self { addr, data }
    }
}

/// Which end of the connection this channel is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSide {
    /// The host; receives qports.
    Host,
    /// A participant; sends its qport.
    User,
}

/// Anti-spoofing checksum of a connected packet.
pub fn packet_checksum(challenge: i32, sequence: i32) -> i32 {
    challenge ^ sequence.wrapping_mul(challenge)
}

/// Read the qport of a participant packet without consuming it.
pub fn peek_qport(packet: &[u8]) -> Option<u16> {
    let b = packet.get(4..6)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

/// One end of a sequenced channel.
#[derive(Debug, Clone)]
pub struct Netchan {
    side: ChannelSide,
    remote: SocketAddr,
    qport: u16,
    challenge: i32,
    legacy: bool,

    incoming_sequence: i32,
    outgoing_sequence: i32,
    dropped: i32,

    fragment_sequence: i32,
    fragment_buffer: Vec<u8>,

    unsent: Vec<u8>,
    unsent_start: usize,
    unsent_fragments: bool,

    last_sent_time: u64,
    last_sent_size: usize,
}

impl Netchan {
    /// Create a channel to `remote`.
    pub fn new(side: ChannelSide, remote: SocketAddr, qport: u16, challenge: i32, legacy: bool) -> Self {
        Self {
            side,
            remote,
            qport,
            challenge,
            legacy,
            incoming_sequence: 0,
            outgoing_sequence: 1,
            dropped: 0,
            fragment_sequence: 0,
            fragment_buffer: Vec::new(),
            unsent: Vec::new(),
            unsent_start: 0,
            unsent_fragments: false,
            last_sent_time: 0,
            last_sent_size: 0,
        }
    }

    /// Peer address.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Follow the peer to a new port.
    pub fn set_remote(&mut self, remote: SocketAddr) {
        self.remote = remote;
    }

    /// Participant's port discriminator.
    pub fn qport(&self) -> u16 {
        self.qport
    }

    /// Challenge bound to this connection.
    pub fn challenge(&self) -> i32 {
        self.challenge
    }

    /// Legacy peers carry no checksum.
    pub fn is_legacy(&self) -> bool {
        self.legacy
    }

    /// Sequence the next message will carry.
    pub fn outgoing_sequence(&self) -> i32 {
        self.outgoing_sequence
    }

    /// Sequence of the last complete message received.
    pub fn incoming_sequence(&self) -> i32 {
        self.incoming_sequence
    }

    /// Packets lost before the last accepted one.
    pub fn dropped(&self) -> i32 {
        self.dropped
    }

    /// True while a fragmented message is partially sent.
    pub fn has_unsent_fragments(&self) -> bool {
        self.unsent_fragments
    }

    /// Time of the last datagram sent.
    pub fn last_sent_time(&self) -> u64 {
        self.last_sent_time
    }

    /// Size of the last datagram sent.
    pub fn last_sent_size(&self) -> usize {
        self.last_sent_size
    }

    fn write_header(&self, out: &mut Vec<u8>, sequence: u32) {
        out.extend_from_slice(&sequence.to_le_bytes());
        if self.side == ChannelSide::User {
            out.extend_from_slice(&self.qport.to_le_bytes());
        }
        if !self.legacy {
            let checksum = packet_checksum(self.challenge, self.outgoing_sequence);
            out.extend_from_slice(&checksum.to_le_bytes());
        }
    }

    /// Send a message, returning the first datagram.
    ///
    /// Messages of [`FRAGMENT_SIZE`] bytes or more are split; the remaining
    /// fragments come from [`transmit_next_fragment`](Self::transmit_next_fragment).
    pub fn transmit(&mut self, data: &[u8], now: u64) -> TransportResult<Vec<u8>> {
        if data.len() > MAX_MSG_LEN {
            return Err(TransportError::Oversize(data.len()));
        }
        self.unsent_start = 0;

        if data.len() >= FRAGMENT_SIZE {
            self.unsent_fragments = true;
            self.unsent.clear();
            self.unsent.extend_from_slice(data);
            return self.transmit_next_fragment(now);
        }

        let mut out = Vec::with_capacity(data.len() + 10);
        self.write_header(&mut out, self.outgoing_sequence as u32);
        out.extend_from_slice(data);

        self.outgoing_sequence = self.outgoing_sequence.wrapping_add(1);
        self.last_sent_time = now;
        self.last_sent_size = out.len();
        Ok(out)
    }

    /// Send the next fragment of a split message.
    pub fn transmit_next_fragment(&mut self, now: u64) -> TransportResult<Vec<u8>> {
        if !self.unsent_fragments {
            return Err(TransportError::Idle);
        }

        let length = FRAGMENT_SIZE.min(self.unsent.len() - self.unsent_start);
        let mut out = Vec::with_capacity(length + 14);
        self.write_header(&mut out, self.outgoing_sequence as u32 | FRAGMENT_BIT);
        out.extend_from_slice(&(self.unsent_start as u16).to_le_bytes());
        out.extend_from_slice(&(length as u16).to_le_bytes());
        out.extend_from_slice(&self.unsent[self.unsent_start..self.unsent_start + length]);

        self.last_sent_time = now;
        self.last_sent_size = out.len();
        self.unsent_start += length;

        // A full-size final fragment is followed by an empty one.
        if self.unsent_start == self.unsent.len() && length != FRAGMENT_SIZE {
            self.outgoing_sequence = self.outgoing_sequence.wrapping_add(1);
            self.unsent_fragments = false;
        }
        Ok(out)
    }

    /// Accept a datagram, returning the completed message payload.
    ///
    /// Returns [`TransportError::Incomplete`] while fragments are
    /// outstanding.
    pub fn process(&mut self, packet: &[u8]) -> TransportResult<Vec<u8>> {
        if packet.len() > MAX_PACKET_LEN + 16 {
            return Err(TransportError::Oversize(packet.len()));
        }
        let mut r = MessageReader::new(packet);
        let raw = r.read_u32()?;
        let fragmented = raw & FRAGMENT_BIT != 0;
        let sequence = (raw & !FRAGMENT_BIT) as i32;

        if self.side == ChannelSide::Host {
            r.read_u16()?;
        }
        if !self.legacy && r.read_i32()? != packet_checksum(self.challenge, sequence) {
            return Err(TransportError::BadChecksum);
        }

        let (fragment_start, fragment_length) = if fragmented {
            (r.read_u16()? as usize, r.read_u16()? as usize)
        } else {
            (0, 0)
        };

        if sequence.wrapping_sub(self.incoming_sequence) <= 0 {
            return Err(TransportError::OutOfOrder {
                sequence,
                last: self.incoming_sequence,
            });
        }

        let lost = sequence.wrapping_sub(self.incoming_sequence.wrapping_add(1));
        if lost > 0 {
            debug!(remote = %self.remote, lost, sequence, "dropped packets");
        }

        if !fragmented {
            self.dropped = lost;
            self.incoming_sequence = sequence;
            return Ok(r.read_bytes(r.remaining())?.to_vec());
        }

        if sequence != self.fragment_sequence {
            self.fragment_sequence = sequence;
            self.fragment_buffer.clear();
        }
        if fragment_start != self.fragment_buffer.len() {
            return Err(TransportError::FragmentGap {
                start: fragment_start,
                have: self.fragment_buffer.len(),
            });
        }
        if fragment_length > r.remaining() || self.fragment_buffer.len() + fragment_length > MAX_MSG_LEN {
            return Err(TransportError::Oversize(self.fragment_buffer.len() + fragment_length));
        }
        self.fragment_buffer.extend_from_slice(r.read_bytes(fragment_length)?);

        if fragment_length == FRAGMENT_SIZE {
            return Err(TransportError::Incomplete);
        }

        self.dropped = lost;
        self.incoming_sequence = sequence;
        Ok(std::mem::take(&mut self.fragment_buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn pair(legacy: bool) -> (Netchan, Netchan) {
        let host = Netchan::new(ChannelSide::Host, test_addr(27961), 555, 0x1234_5678, legacy);
        let user = Netchan::new(ChannelSide::User, test_addr(27960), 555, 0x1234_5678, legacy);
        (host, user)
    }

    #[test]
    fn test_small_message() {
        let (mut host, mut user) = pair(false);
        let packet = user.transmit(b"hello", 0).unwrap();
        assert_eq!(peek_qport(&packet), Some(555));
        assert_eq!(host.process(&packet).unwrap(), b"hello");
        assert_eq!(host.incoming_sequence(), 1);
        assert_eq!(user.outgoing_sequence(), 2);
    }

    #[test]
    fn test_duplicate_dropped() {
        let (mut host, mut user) = pair(false);
        let packet = user.transmit(b"once", 0).unwrap();
        host.process(&packet).unwrap();
        assert!(matches!(host.process(&packet), Err(TransportError::OutOfOrder { .. })));
    }

    #[test]
    fn test_bad_checksum() {
        let (mut host, mut user) = pair(false);
        let mut packet = user.transmit(b"spoof", 0).unwrap();
        packet[6] ^= 0xFF;
        assert!(matches!(host.process(&packet), Err(TransportError::BadChecksum)));
    }

    #[test]
    fn test_legacy_has_no_checksum() {
        let (mut host, mut user) = pair(true);
        let packet = user.transmit(b"old", 0).unwrap();
        assert_eq!(packet.len(), 4 + 2 + 3);
        assert_eq!(host.process(&packet).unwrap(), b"old");
    }

    #[test]
    fn test_fragmented_reassembly() {
        let (mut host, mut user) = pair(false);
        let message: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();

        let mut packets = vec![host.transmit(&message, 0).unwrap()];
        while host.has_unsent_fragments() {
            packets.push(host.transmit_next_fragment(0).unwrap());
        }
        assert_eq!(packets.len(), 3);

        let mut out = None;
        for p in &packets {
            match user.process(p) {
                Ok(m) => out = Some(m),
                Err(TransportError::Incomplete) => {}
                Err(e) => panic!("unexpected {e}"),
            }
        }
        assert_eq!(out.unwrap(), message);
    }

    #[test]
    fn test_exact_multiple_sends_empty_tail() {
        let (mut host, mut user) = pair(false);
        let message = vec![7u8; FRAGMENT_SIZE * 2];

        let mut packets = vec![host.transmit(&message, 0).unwrap()];
        while host.has_unsent_fragments() {
            packets.push(host.transmit_next_fragment(0).unwrap());
        }
        assert_eq!(packets.len(), 3);

        let results: Vec<_> = packets.iter().map(|p| user.process(p)).collect();
        assert!(matches!(results[0], Err(TransportError::Incomplete)));
        assert!(matches!(results[1], Err(TransportError::Incomplete)));
        assert_eq!(results[2].as_ref().unwrap().len(), message.len());
    }

    #[test]
    fn test_lost_fragment_drops_message() {
        let (mut host, mut user) = pair(false);
        let message = vec![1u8; 3000];
        let first = host.transmit(&message, 0).unwrap();
        let _lost = host.transmit_next_fragment(0).unwrap();
        let last = host.transmit_next_fragment(0).unwrap();

        assert!(matches!(user.process(&first), Err(TransportError::Incomplete)));
        assert!(matches!(user.process(&last), Err(TransportError::FragmentGap { .. })));
    }

    #[test]
    fn test_oversize_rejected() {
        let (mut host, _) = pair(false);
        assert!(matches!(
            host.transmit(&vec![0u8; MAX_MSG_LEN + 1], 0),
            Err(TransportError::Oversize(_))
        ));
    }
}
