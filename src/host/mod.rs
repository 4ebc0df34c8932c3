//! Tickwire - Host Layer
//!
//! The authoritative end of the protocol:
//!
//! - **Admission**: challenge handshake, slot selection, reconnects
//! - **Participant state machine**: `Free → Connected → Primed → Active`,
//!   with `Zombie` lingering after a drop
//! - **Broadcast state**: configstrings and baselines in the gamestate
//! - **Snapshots**: per-participant visibility and delta encoding each tick
//! - **Downloads**: windowed file transfer outside the world
//!
//! [`Host`] is sans-I/O; [`run`] drives it on a tokio socket.

mod config;
mod configstrings;
mod download;
#[allow(clippy::module_inception)]
mod host;
mod participant;
#[cfg(feature = "runtime")]
mod runner;
mod simulation;
mod table;

pub use config::*;
pub use configstrings::*;
pub use download::*;
pub use host::*;
pub use participant::*;
#[cfg(feature = "runtime")]
pub use runner::*;
pub use simulation::*;
pub use table::*;
