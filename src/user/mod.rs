//! Tickwire - User Layer
//!
//! The participant end of the protocol, for Rust peers and tests:
//!
//! - **Handshake**: `getchallenge` → `connect` with retries
//! - **Reliable commands**: outgoing ring, host command execution,
//!   configstring reassembly
//! - **Gamestate and snapshots**: baselines and delta decoding against the
//!   retained [`SnapshotHistory`]
//! - **Downloads**: in-order block reception with `nextdl` acknowledgments
//!
//! ```rust,no_run
//! use tickwire::user::{UserConnectionBuilder, UserEvent};
//!
//! let mut conn = UserConnectionBuilder::new("127.0.0.1:27960".parse().unwrap())
//!     .name("player")
//!     .rate(25_000)
//!     .build();
//! conn.connect(0);
//! for datagram in conn.drain_outgoing() {
//!     // send datagram.data to datagram.addr
//!     let _ = datagram;
//! }
//! while let Some(event) = conn.poll_event() {
//!     if let UserEvent::Gamestate = event {
//!         println!("in: {}", conn.configstring(1));
//!     }
//! }
//! ```

mod config;
mod connection;
mod download;
mod snapshot;

pub use config::*;
pub use connection::*;
pub use download::*;
pub use snapshot::*;
