//! Tickwire - Sync Layer
//!
//! Implements:
//! - Message buffers and op tags ([`MessageWriter`], [`MessageReader`])
//! - Field-wise delta coding for [`EntityState`], [`PlayerState`] and
//!   [`UserCmd`]
//! - Command-line tokenizing ([`tokenize`])
//! - The reliable command channel ([`ReliableRing`], [`InboundCommands`])

mod command;
mod delta;
mod entity;
mod message;
mod player;
mod reliable;
mod usercmd;

pub use command::*;
pub use delta::*;
pub use entity::*;
pub use message::*;
pub use player::*;
pub use reliable::*;
pub use usercmd::*;
