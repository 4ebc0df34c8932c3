//! Tickwire - Admission
//!
//! Everything that happens before a participant owns a slot:
//!
//! - **Challenges**: [`ChallengeIssuer`] derives stateless tokens bound to
//!   the requester's address and a coarse time bucket
//! - **Rate limiting**: [`LeakyBucket`] and [`AddressLimiter`]
//! - **Connectionless messages**: [`OobMessage`] and [`UserInfo`]

mod challenge;
mod handshake;
mod rate_limit;

pub use challenge::*;
pub use handshake::*;
pub use rate_limit::*;
