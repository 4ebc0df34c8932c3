//! Tickwire - Snapshot Layer
//!
//! Per tick the host builds one [`CommonFrame`] of shareable entities in
//! [`SnapshotStorage`], then for each participant:
//!
//! ```text
//! SharedEntity[] ──► SnapshotStorage::build ──► CommonFrame
//!                                                   │
//!                 VisibilityMap + PlayerState ──► visible_entities
//!                                                   │
//!                                              ParticipantFrame ──► FrameRing
//!                                                   │
//!                 FrameRing::delta_reference ──► write_snapshot
//! ```

mod baseline;
mod emit;
mod entity;
mod frame;
mod storage;
mod visibility;

pub use baseline::*;
pub use emit::*;
pub use entity::*;
pub use frame::*;
pub use storage::*;
pub use visibility::*;
