//! Byte-rate pacing.
//!
//! A participant announces the bytes per second it can absorb. After each
//! datagram the channel waits long enough for that datagram (plus UDP/IP
//! overhead) to drain at the announced rate.

use super::netchan::Netchan;
use crate::core::{UDP_IP6_HEADER_SIZE, UDP_IP_HEADER_SIZE};

/// Pacing constants.
pub mod constants {
    /// Rate used when a participant announces none.
    pub const DEFAULT_RATE: u32 = 10_000;

    /// Lowest accepted rate (bytes per second).
    pub const MIN_RATE: u32 = 1_000;

    /// Highest accepted rate (bytes per second).
    pub const MAX_RATE: u32 = 90_000;
}

/// Byte-rate pacer for one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePacer {
    /// Bytes per second; 0 disables pacing.
    rate: u32,
    /// Charge the IPv6 header size instead of IPv4.
    ipv6: bool,
}

impl RatePacer {
    /// Create a pacer.
    pub fn new(rate: u32, ipv6: bool) -> Self {
        Self { rate, ipv6 }
    }

    /// An unpaced pacer (loopback, LAN, bots).
    pub fn unlimited() -> Self {
        Self::new(0, false)
    }

    /// Bytes per second; 0 when unlimited.
    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Change the rate.
    pub fn set_rate(&mut self, rate: u32) {
        self.rate = rate;
    }

    /// Milliseconds still to wait after sending `last_size` bytes at
    /// `last_time`.
    pub fn wait_ms(&self, last_size: usize, last_time: u64, now: u64) -> u64 {
        if self.rate == 0 {
            return 0;
        }
        let header = if self.ipv6 {
            UDP_IP6_HEADER_SIZE
        } else {
            UDP_IP_HEADER_SIZE
        };
        let drain = (last_size + header) as u64 * 1000 / self.rate as u64;
        drain.saturating_sub(now.saturating_sub(last_time))
    }

    /// Wait computed from a channel's last datagram.
    pub fn wait_for(&self, chan: &Netchan, now: u64) -> u64 {
        self.wait_ms(chan.last_sent_size(), chan.last_sent_time(), now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_waits() {
        assert_eq!(RatePacer::unlimited().wait_ms(1400, 100, 100), 0);
    }

    #[test]
    fn test_wait_drains_with_header() {
        // (972 + 28) bytes at 10000 B/s drain in 100 ms.
        let pacer = RatePacer::new(10_000, false);
        assert_eq!(pacer.wait_ms(972, 1000, 1000), 100);
        assert_eq!(pacer.wait_ms(972, 1000, 1060), 40);
        assert_eq!(pacer.wait_ms(972, 1000, 1100), 0);
        assert_eq!(pacer.wait_ms(972, 1000, 5000), 0);
    }

    #[test]
    fn test_ipv6_header_costs_more() {
        let v4 = RatePacer::new(1000, false);
        let v6 = RatePacer::new(1000, true);
        assert!(v6.wait_ms(100, 0, 0) > v4.wait_ms(100, 0, 0));
    }
}
