//! Stateless challenge tokens.
//!
//! A token is a keyed BLAKE2s MAC over the requester's address and a coarse
//! time bucket (`time_ms >> 14`, about 16 s). Bit 31 holds the bucket's
//! parity so verification against the current bucket can tell whether the
//! token was issued in the previous one. Nothing is stored per request.

use std::net::{IpAddr, SocketAddr};

use blake2::Blake2sMac256;
use blake2::digest::Mac;
use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::core::CHALLENGE_TIME_SHIFT;

/// Secret key for challenge derivation.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ChallengeSecret([u8; 32]);

impl ChallengeSecret {
    /// Generate a fresh random secret.
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Use a fixed secret (tests, multi-process hosts sharing one key).
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self(key)
    }
}

impl std::fmt::Debug for ChallengeSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChallengeSecret(..)")
    }
}

/// The time bucket `now_ms` falls in.
pub fn time_bucket(now_ms: u64) -> u64 {
    now_ms >> CHALLENGE_TIME_SHIFT
}

/// Issues and verifies challenge tokens.
#[derive(Debug, Clone)]
pub struct ChallengeIssuer {
    secret: ChallengeSecret,
}

impl ChallengeIssuer {
    /// Create an issuer with a random secret.
    pub fn new() -> Self {
        Self::with_secret(ChallengeSecret::generate())
    }

    /// Create an issuer with the given secret.
    pub fn with_secret(secret: ChallengeSecret) -> Self {
        Self { secret }
    }

    /// Derive the token for `addr` in time bucket `bucket`.
    pub fn create(&self, bucket: u64, addr: &SocketAddr) -> i32 {
        let Ok(mut mac) = <Blake2sMac256 as Mac>::new_from_slice(&self.secret.0) else {
            // A 32-byte key is always accepted by BLAKE2s.
            return 0;
        };
        match addr.ip() {
            IpAddr::V4(ip) => mac.update(&ip.octets()),
            IpAddr::V6(ip) => mac.update(&ip.octets()),
        }
        mac.update(&addr.port().to_le_bytes());
        mac.update(&bucket.to_le_bytes());
        let digest = mac.finalize().into_bytes();

        let hash = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) & 0x7FFF_FFFF;
        (hash | (((bucket & 1) as u32) << 31)) as i32
    }

    /// Issue a token for `addr` at `now_ms`.
    pub fn issue(&self, addr: &SocketAddr, now_ms: u64) -> i32 {
        self.create(time_bucket(now_ms), addr)
    }

    /// Check a token presented by `addr` at `now_ms`.
    ///
    /// Accepts tokens issued in the current bucket, or in the previous one
    /// when the parity bit says so.
    pub fn verify(&self, token: i32, addr: &SocketAddr, now_ms: u64) -> bool {
        let current = time_bucket(now_ms);
        let token_parity = (token as u32 >> 31) as u64;
        let issued = current.wrapping_sub((current & 1) ^ token_parity);
        self.create(issued, addr) == token
    }
}

impl Default for ChallengeIssuer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr(port: u16) -> SocketAddr {
        format!("10.0.0.7:{port}").parse().unwrap()
    }

    fn issuer() -> ChallengeIssuer {
        ChallengeIssuer::with_secret(ChallengeSecret::from_bytes([7u8; 32]))
    }

    const BUCKET_MS: u64 = 1 << CHALLENGE_TIME_SHIFT;

    #[test]
    fn test_verify_same_bucket() {
        let issuer = issuer();
        let addr = test_addr(27960);
        let token = issuer.issue(&addr, 5 * BUCKET_MS + 10);
        assert!(issuer.verify(token, &addr, 5 * BUCKET_MS + 9000));
    }

    #[test]
    fn test_verify_next_bucket() {
        let issuer = issuer();
        let addr = test_addr(27960);
        for start in [4, 5] {
            let token = issuer.create(start, &addr);
            assert!(issuer.verify(token, &addr, (start + 1) * BUCKET_MS));
        }
    }

    #[test]
    fn test_reject_two_buckets_later() {
        let issuer = issuer();
        let addr = test_addr(27960);
        let token = issuer.create(6, &addr);
        assert!(!issuer.verify(token, &addr, 8 * BUCKET_MS));
    }

    #[test]
    fn test_reject_other_address() {
        let issuer = issuer();
        let token = issuer.create(6, &test_addr(27960));
        assert!(!issuer.verify(token, &test_addr(27961), 6 * BUCKET_MS));
        let other_ip: SocketAddr = "10.0.0.8:27960".parse().unwrap();
        assert!(!issuer.verify(token, &other_ip, 6 * BUCKET_MS));
    }

    #[test]
    fn test_parity_bit() {
        let issuer = issuer();
        let addr = test_addr(1);
        assert!(issuer.create(2, &addr) >= 0);
        assert!(issuer.create(3, &addr) < 0);
    }

    #[test]
    fn test_secrets_differ() {
        let a = ChallengeIssuer::new();
        let b = ChallengeIssuer::new();
        let addr = test_addr(1);
        assert_ne!(a.create(1, &addr), b.create(1, &addr));
    }
}
