//! Leaky-bucket rate limiting.
//!
//! A bucket admits `burst` events, then one more per elapsed `period`.
//! Buckets keyed by source IP guard connectionless requests; per-participant
//! buckets guard individual command kinds.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::core::MAX_RATE_BUCKETS;

/// A single leaky bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeakyBucket {
    last_time: u64,
    level: u32,
}

impl LeakyBucket {
    /// Create an empty bucket.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event at `now`. Returns `true` when the event must be
    /// refused.
    pub fn is_limited(&mut self, burst: u32, period_ms: u64, now: u64) -> bool {
        let period_ms = period_ms.max(1);
        match now.checked_sub(self.last_time) {
            Some(interval) => {
                let expired = interval / period_ms;
                if expired > self.level as u64 {
                    self.level = 0;
                    self.last_time = now;
                } else {
                    self.level -= expired as u32;
                    self.last_time = now - interval % period_ms;
                }
            }
            // Clock went backwards.
            None => {
                self.level = 0;
                self.last_time = now;
            }
        }

        if self.level < burst {
            self.level += 1;
            false
        } else {
            true
        }
    }

    /// Give back up to `count` events.
    pub fn restore(&mut self, count: u32) {
        self.level = self.level.saturating_sub(count);
    }

    /// Time of the last event or drain.
    pub fn last_time(&self) -> u64 {
        self.last_time
    }
}

/// Buckets keyed by source IP.
#[derive(Debug, Clone)]
pub struct AddressLimiter {
    burst: u32,
    period_ms: u64,
    buckets: HashMap<IpAddr, LeakyBucket>,
    max_buckets: usize,
}

impl AddressLimiter {
    /// Create a limiter admitting `burst` events per address, refilling one
    /// per `period_ms`.
    pub fn new(burst: u32, period_ms: u64) -> Self {
        Self {
            burst,
            period_ms,
            buckets: HashMap::new(),
            max_buckets: MAX_RATE_BUCKETS,
        }
    }

    /// Record an event from `ip`. Returns `true` when it must be refused.
    pub fn is_limited(&mut self, ip: IpAddr, now: u64) -> bool {
        if self.buckets.len() >= self.max_buckets && !self.buckets.contains_key(&ip) {
            self.prune(now);
        }
        self.buckets
            .entry(ip)
            .or_default()
            .is_limited(self.burst, self.period_ms, now)
    }

    /// Give back `count` events to `ip`.
    pub fn restore(&mut self, ip: IpAddr, count: u32) {
        if let Some(bucket) = self.buckets.get_mut(&ip) {
            bucket.restore(count);
        }
    }

    /// Forget buckets idle long enough to have fully drained.
    pub fn prune(&mut self, now: u64) {
        let idle = self.period_ms.saturating_mul(self.burst as u64 + 1);
        self.buckets
            .retain(|_, bucket| now.saturating_sub(bucket.last_time()) < idle);
    }

    /// Buckets currently tracked.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// True if no buckets are tracked.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_refill() {
        let mut bucket = LeakyBucket::new();
        for _ in 0..10 {
            assert!(!bucket.is_limited(10, 1000, 0));
        }
        assert!(bucket.is_limited(10, 1000, 500));
        assert!(!bucket.is_limited(10, 1000, 1000));
        assert!(bucket.is_limited(10, 1000, 1001));
    }

    #[test]
    fn test_long_idle_resets() {
        let mut bucket = LeakyBucket::new();
        for _ in 0..10 {
            bucket.is_limited(10, 1000, 0);
        }
        for _ in 0..10 {
            assert!(!bucket.is_limited(10, 1000, 60_000));
        }
    }

    #[test]
    fn test_restore_gives_back() {
        let mut bucket = LeakyBucket::new();
        bucket.is_limited(1, 1000, 0);
        assert!(bucket.is_limited(1, 1000, 0));
        bucket.restore(1);
        assert!(!bucket.is_limited(1, 1000, 0));
    }

    #[test]
    fn test_addresses_independent() {
        let mut limiter = AddressLimiter::new(2, 1000);
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(!limiter.is_limited(a, 0));
        assert!(!limiter.is_limited(a, 0));
        assert!(limiter.is_limited(a, 0));
        assert!(!limiter.is_limited(b, 0));
    }

    #[test]
    fn test_prune_idle() {
        let mut limiter = AddressLimiter::new(2, 100);
        limiter.is_limited("10.0.0.1".parse().unwrap(), 0);
        limiter.is_limited("10.0.0.2".parse().unwrap(), 250);
        limiter.prune(320);
        assert_eq!(limiter.len(), 1);
    }
}
