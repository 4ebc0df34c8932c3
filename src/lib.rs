//! # Tickwire
//!
//! Host/participant snapshot synchronization over unreliable datagrams.
//!
//! A single authoritative host runs a fixed-rate simulation and, every
//! tick, sends each connected participant a snapshot of the world that
//! participant can see, delta-compressed against the last snapshot the
//! participant acknowledged. It provides:
//!
//! - **Admission**: stateless challenge tokens, per-address and global
//!   rate limits, slot selection and reconnect handling
//! - **Reliability where needed**: an ordered, acknowledged command
//!   channel in both directions on top of lossy datagrams
//! - **Bandwidth**: per-participant visibility, field-wise delta coding
//!   and byte-rate pacing
//! - **Side transfers**: windowed file downloads outside the world
//!
//! ## Feature Flags
//!
//! - `runtime` (default): tokio UDP socket and tick loop driver
//! - `user` (default): the participant end of the protocol
//!
//! ## Modules
//!
//! - [`core`]: Core traits, constants, and error types
//! - [`admission`]: Challenges, rate limits, connectionless messages
//! - [`transport`]: Sequenced channel, fragmentation, pacing
//! - [`sync`]: Message buffers, delta coding, reliable commands
//! - [`snapshot`]: Frame storage, visibility, snapshot encoding
//! - [`host`]: The authoritative host
//! - [`user`]: The participant (requires `user` feature)
//!
//! ## Example Usage
//!
//! ```rust
//! use tickwire::prelude::*;
//!
//! struct Empty {
//!     world: OpenWorld,
//! }
//!
//! impl Simulation for Empty {
//!     fn entities(&self) -> &[SharedEntity] {
//!         &[]
//!     }
//!
//!     fn player_state(&self, _id: usize) -> PlayerState {
//!         PlayerState::default()
//!     }
//!
//!     fn visibility(&self) -> &dyn VisibilityMap {
//!         &self.world
//!     }
//! }
//!
//! let config = HostConfigBuilder::new().max_participants(4).build().unwrap();
//! let mut host = Host::new(config, Empty { world: OpenWorld }).unwrap();
//! host.run_frame(0).unwrap();
//! assert!(host.drain_outgoing().is_empty());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

pub mod admission;
pub mod host;
pub mod snapshot;
pub mod sync;
pub mod transport;

// Participant side (feature-gated)
#[cfg(feature = "user")]
#[cfg_attr(docsrs, doc(cfg(feature = "user")))]
pub mod user;

/// Prelude module for convenient imports.
pub mod prelude {
    // Core traits and types
    pub use crate::core::*;

    pub use crate::host::{
        AssetVerifier, DropReason, FileStore, Host, HostConfig, HostConfigBuilder, ParticipantState, Simulation,
    };
    pub use crate::snapshot::{OpenWorld, SharedEntity, VisibilityMap};
    pub use crate::sync::{EntityState, PlayerState, UserCmd};
    pub use crate::transport::{Datagram, TransportError};

    #[cfg(feature = "runtime")]
    pub use crate::host::run;
    #[cfg(feature = "runtime")]
    pub use crate::transport::HostSocket;

    #[cfg(feature = "user")]
    pub use crate::user::{UserConnection, UserConnectionBuilder, UserEvent, UserState};
}

// Re-export commonly used items at crate root
pub use core::{DeltaState, HostError};
pub use host::{Host, HostConfig, Simulation};
