//! Ordered outgoing message queue over a [`Netchan`].
//!
//! While a fragmented message is still going out, or earlier messages are
//! waiting, new messages join a FIFO instead of being sent. Legacy XOR
//! obfuscation depends on the sequence a message is finally sent under, so
//! queued messages are encoded only when they leave the queue.

use std::collections::VecDeque;

use tracing::debug;

use super::error::{TransportError, TransportResult};
use super::legacy::host_encode;
use super::netchan::Netchan;
use super::pacing::RatePacer;

#[derive(Debug, Clone)]
struct QueuedMessage {
    data: Vec<u8>,
    last_user_command: String,
}

/// A participant's outgoing path: channel, FIFO and pacer.
#[derive(Debug, Clone)]
pub struct TransportQueue {
    chan: Netchan,
    queue: VecDeque<QueuedMessage>,
    pacer: RatePacer,
}

impl TransportQueue {
    /// Wrap a channel.
    pub fn new(chan: Netchan, pacer: RatePacer) -> Self {
        Self {
            chan,
            queue: VecDeque::new(),
            pacer,
        }
    }

    /// The channel.
    pub fn chan(&self) -> &Netchan {
        &self.chan
    }

    /// The channel, mutably (receive path).
    pub fn chan_mut(&mut self) -> &mut Netchan {
        &mut self.chan
    }

    /// The pacer.
    pub fn pacer(&self) -> &RatePacer {
        &self.pacer
    }

    /// The pacer, mutably.
    pub fn pacer_mut(&mut self) -> &mut RatePacer {
        &mut self.pacer
    }

    /// Messages waiting behind the current one.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// True while fragments or queued messages are pending.
    pub fn is_busy(&self) -> bool {
        self.chan.has_unsent_fragments() || !self.queue.is_empty()
    }

    /// Milliseconds until the pacer allows another datagram.
    pub fn wait_ms(&self, now: u64) -> u64 {
        self.pacer.wait_for(&self.chan, now)
    }

    /// Send a finished message, or queue it behind pending traffic.
    ///
    /// Returns the datagram to put on the wire, if any was produced now.
    pub fn transmit(
        &mut self,
        mut data: Vec<u8>,
        last_user_command: &str,
        now: u64,
    ) -> TransportResult<Option<Vec<u8>>> {
        if self.is_busy() {
            debug!(
                remote = %self.chan.remote(),
                queued = self.queue.len() + 1,
                "queueing message behind pending fragments"
            );
            self.queue.push_back(QueuedMessage {
                data,
                last_user_command: last_user_command.to_owned(),
            });
            return Ok(None);
        }
        self.encode(&mut data, last_user_command);
        self.chan.transmit(&data, now).map(Some)
    }

    /// Drain exactly one pending fragment or queued message.
    pub fn transmit_next(&mut self, now: u64) -> TransportResult<Vec<u8>> {
        if self.chan.has_unsent_fragments() {
            return self.chan.transmit_next_fragment(now);
        }
        let Some(mut next) = self.queue.pop_front() else {
            return Err(TransportError::Idle);
        };
        self.encode(&mut next.data, &next.last_user_command);
        self.chan.transmit(&next.data, now)
    }

    fn encode(&self, data: &mut [u8], last_user_command: &str) {
        if self.chan.is_legacy() {
            host_encode(
                data,
                self.chan.challenge(),
                self.chan.outgoing_sequence(),
                last_user_command,
            );
        }
    }

    /// Drop everything pending.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::core::FRAGMENT_SIZE;
    use crate::transport::{ChannelSide, legacy::user_decode};

    fn test_addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn queue(legacy: bool) -> TransportQueue {
        let chan = Netchan::new(ChannelSide::Host, test_addr(27960), 7, 42, legacy);
        TransportQueue::new(chan, RatePacer::unlimited())
    }

    fn user(legacy: bool) -> Netchan {
        Netchan::new(ChannelSide::User, test_addr(27961), 7, 42, legacy)
    }

    #[test]
    fn test_idle_sends_immediately() {
        let mut q = queue(false);
        let sent = q.transmit(b"abcd-message".to_vec(), "", 0).unwrap();
        assert!(sent.is_some());
        assert!(!q.is_busy());
        assert!(matches!(q.transmit_next(0), Err(TransportError::Idle)));
    }

    #[test]
    fn test_paced_after_last_datagram() {
        let chan = Netchan::new(ChannelSide::Host, test_addr(27960), 7, 42, false);
        let mut q = TransportQueue::new(chan, RatePacer::new(10_000, false));
        assert_eq!(q.wait_ms(500), 0);

        // 8 header bytes + 964 payload + 28 UDP/IP drain in 100 ms.
        let sent = q.transmit(vec![0u8; 964], "", 1000).unwrap().unwrap();
        assert_eq!(sent.len(), 972);
        assert_eq!(q.wait_ms(1000), 100);
        assert_eq!(q.wait_ms(1075), 25);
        assert_eq!(q.wait_ms(1100), 0);
    }

    #[test]
    fn test_queued_behind_fragments_in_order() {
        let mut q = queue(false);
        let mut peer = user(false);
        let big = vec![1u8; FRAGMENT_SIZE + 10];

        let mut wire = vec![q.transmit(big.clone(), "", 0).unwrap().unwrap()];
        assert!(q.transmit(b"second".to_vec(), "", 0).unwrap().is_none());
        assert!(q.transmit(b"third".to_vec(), "", 0).unwrap().is_none());
        assert_eq!(q.queued(), 2);

        while q.is_busy() {
            wire.push(q.transmit_next(0).unwrap());
        }

        let delivered: Vec<Vec<u8>> = wire.iter().filter_map(|p| peer.process(p).ok()).collect();
        assert_eq!(delivered, vec![big, b"second".to_vec(), b"third".to_vec()]);
    }

    #[test]
    fn test_legacy_encoded_under_final_sequence() {
        let mut q = queue(true);
        let mut peer = user(true);
        let big = vec![9u8; FRAGMENT_SIZE];
        let small = b"\x05\x00\x00\x00queued payload".to_vec();

        let mut wire = vec![q.transmit(big, "cmd one", 0).unwrap().unwrap()];
        q.transmit(small.clone(), "cmd two", 0).unwrap();
        while q.is_busy() {
            wire.push(q.transmit_next(0).unwrap());
        }

        let mut last = None;
        for p in &wire {
            if let Ok(m) = peer.process(p) {
                last = Some(m);
            }
        }
        let mut got = last.unwrap();
        user_decode(&mut got, 42, peer.incoming_sequence(), "cmd two");
        assert_eq!(got, small);
    }
}
