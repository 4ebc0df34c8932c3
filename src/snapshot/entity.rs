//! Simulation-owned entity records as seen by the snapshot builder.

use crate::sync::EntityState;

/// Delivery flags on a shared entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ShareFlags(u32);

impl ShareFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Never sent to anyone.
    pub const NO_PARTICIPANTS: Self = Self(0x01);
    /// Sent only to the participant in `target`.
    pub const SINGLE_PARTICIPANT: Self = Self(0x02);
    /// Sent to everyone except the participant in `target`.
    pub const NOT_SINGLE_PARTICIPANT: Self = Self(0x04);
    /// Sent only to participants whose bit is set in `target` (ids < 32).
    pub const PARTICIPANT_MASK: Self = Self(0x08);
    /// Sent to everyone regardless of visibility.
    pub const BROADCAST: Self = Self(0x10);
    /// Viewpoint into another region; entities visible from `origin2`
    /// are merged in.
    pub const PORTAL: Self = Self(0x20);
    /// On a participant's own entity: also see from its `origin2`.
    pub const SELF_PORTAL: Self = Self(0x40);

    /// Create flags from raw bits.
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// True if every flag in `other` is set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Add flags.
    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Precomputed spatial placement of an entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placement {
    /// Region the entity touches, or -1.
    pub area: i32,
    /// Second region for entities spanning a boundary, or -1.
    pub area2: i32,
    /// Leaf clusters the entity touches.
    pub clusters: Vec<i32>,
}

impl Placement {
    /// Placement in one region and cluster.
    pub fn at(area: i32, cluster: i32) -> Self {
        Self {
            area,
            area2: -1,
            clusters: vec![cluster],
        }
    }

    /// Placed nowhere.
    pub fn unplaced() -> Self {
        Self {
            area: -1,
            area2: -1,
            clusters: Vec::new(),
        }
    }
}

/// One entity slot of the simulation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SharedEntity {
    /// Replicated state; `state.number` is the slot index.
    pub state: EntityState,
    /// Present in the world this tick.
    pub linked: bool,
    /// Delivery flags.
    pub flags: ShareFlags,
    /// Participant id or bit mask for the targeted delivery flags.
    pub target: u32,
    /// Spatial placement.
    pub placement: Placement,
}

impl SharedEntity {
    /// A linked entity with no special delivery rules.
    pub fn linked(state: EntityState, placement: Placement) -> Self {
        Self {
            state,
            linked: true,
            flags: ShareFlags::NONE,
            target: 0,
            placement,
        }
    }

    /// Eligible for the common frame.
    pub fn is_shared(&self) -> bool {
        self.linked && !self.flags.contains(ShareFlags::NO_PARTICIPANTS)
    }

    /// Targeted delivery rules for `participant`.
    pub fn delivers_to(&self, participant: u32) -> bool {
        if self.flags.contains(ShareFlags::SINGLE_PARTICIPANT) && self.target != participant {
            return false;
        }
        if self.flags.contains(ShareFlags::NOT_SINGLE_PARTICIPANT) && self.target == participant {
            return false;
        }
        if self.flags.contains(ShareFlags::PARTICIPANT_MASK)
            && (participant >= 32 || self.target & (1 << participant) == 0)
        {
            return false;
        }
        true
    }
}
