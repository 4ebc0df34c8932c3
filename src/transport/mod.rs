//! Tickwire - Transport Layer
//!
//! Turns logical messages into datagrams and back:
//!
//! - **Sequenced channel**: [`Netchan`] with fragmentation and reassembly
//! - **Ordered queue**: [`TransportQueue`] holding messages behind pending
//!   fragments
//! - **Pacing**: [`RatePacer`] enforcing a participant's byte rate
//! - **Legacy obfuscation**: XOR coding for legacy-protocol peers
//! - **Async sockets**: [`HostSocket`] wrapper for tokio UDP
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     Host / User (state machines)        │
//! ├─────────────────────────────────────────┤
//! │     Sync Layer (deltas, commands)       │
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← This module
//! │   netchan, queue, pacing, legacy XOR    │
//! ├─────────────────────────────────────────┤
//! │              UDP                        │
//! └─────────────────────────────────────────┘
//! ```

mod error;
mod legacy;
mod netchan;
mod pacing;
mod queue;
#[cfg(feature = "runtime")]
mod socket;

pub use error::*;
pub use legacy::*;
pub use netchan::*;
pub use pacing::{RatePacer, constants as pacing_constants};
pub use queue::*;
#[cfg(feature = "runtime")]
pub use socket::*;
