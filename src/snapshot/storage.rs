//! Shared per-tick entity storage.
//!
//! Every tick the host copies all shareable entity states into one common
//! frame held in a circular arena. Participant frames refer to arena slots
//! instead of copying states. Old frames are reclaimed oldest-first when the
//! arena runs short or more than [`NUM_SNAPSHOT_FRAMES`] are retained;
//! anything numbered below [`last_valid_frame`](SnapshotStorage::last_valid_frame)
//! must no longer be read.

use std::collections::VecDeque;

use tracing::debug;

use crate::core::{NUM_SNAPSHOT_FRAMES, SnapshotError};
use crate::sync::EntityState;

/// One tick's worth of shared entity states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonFrame {
    /// Monotonic frame number.
    pub frame_num: u64,
    /// First arena slot.
    pub start: usize,
    /// Entities stored, ascending by id.
    pub count: usize,
}

/// Circular arena of entity states plus the frames that own them.
#[derive(Debug, Clone)]
pub struct SnapshotStorage {
    arena: Vec<EntityState>,
    head: usize,
    free: usize,
    frames: VecDeque<CommonFrame>,
    next_frame: u64,
    last_valid_frame: u64,
}

impl SnapshotStorage {
    /// Create an arena holding `capacity` entity states.
    pub fn new(capacity: usize) -> Self {
        Self {
            arena: vec![EntityState::default(); capacity.max(1)],
            head: 0,
            free: capacity.max(1),
            frames: VecDeque::with_capacity(NUM_SNAPSHOT_FRAMES),
            next_frame: 1,
            last_valid_frame: 1,
        }
    }

    /// Arena size.
    pub fn capacity(&self) -> usize {
        self.arena.len()
    }

    /// Unused arena slots.
    pub fn free(&self) -> usize {
        self.free
    }

    /// Oldest frame number whose storage is intact.
    pub fn last_valid_frame(&self) -> u64 {
        self.last_valid_frame
    }

    /// True if `frame_num` can still be read.
    pub fn is_valid(&self, frame_num: u64) -> bool {
        frame_num >= self.last_valid_frame && frame_num < self.next_frame
    }

    /// The most recently built frame.
    pub fn current(&self) -> Option<&CommonFrame> {
        self.frames.back()
    }

    fn release_oldest(&mut self) -> bool {
        let Some(oldest) = self.frames.pop_front() else {
            return false;
        };
        self.free += oldest.count;
        self.last_valid_frame = oldest.frame_num + 1;
        true
    }

    /// Store the states for a new tick, reclaiming old frames as needed.
    ///
    /// `states` must be ascending by entity id.
    pub fn build<'a, I>(&mut self, states: I) -> Result<CommonFrame, SnapshotError>
    where
        I: IntoIterator<Item = &'a EntityState>,
        I::IntoIter: ExactSizeIterator,
    {
        let states = states.into_iter();
        let count = states.len();

        while self.frames.len() >= NUM_SNAPSHOT_FRAMES {
            self.release_oldest();
        }
        while self.free < count {
            if !self.release_oldest() {
                return Err(SnapshotError::StorageExhausted {
                    needed: count,
                    capacity: self.arena.len(),
                });
            }
            debug!(
                last_valid_frame = self.last_valid_frame,
                "reclaimed snapshot storage early"
            );
        }

        let frame = CommonFrame {
            frame_num: self.next_frame,
            start: self.head,
            count,
        };
        let cap = self.arena.len();
        for state in states {
            self.arena[self.head] = state.clone();
            self.head = (self.head + 1) % cap;
        }
        self.free -= count;
        self.next_frame += 1;
        self.frames.push_back(frame);
        Ok(frame)
    }

    /// Arena slot of the `index`th entity of `frame`.
    pub fn slot(&self, frame: &CommonFrame, index: usize) -> usize {
        (frame.start + index) % self.arena.len()
    }

    /// State held in an arena slot.
    pub fn entity(&self, slot: usize) -> &EntityState {
        &self.arena[slot % self.arena.len()]
    }

    /// `(slot, state)` pairs of a frame, ascending by id.
    pub fn frame_entities<'a>(
        &'a self,
        frame: &CommonFrame,
    ) -> impl Iterator<Item = (usize, &'a EntityState)> + 'a {
        let frame = *frame;
        (0..frame.count).map(move |i| {
            let slot = self.slot(&frame, i);
            (slot, &self.arena[slot])
        })
    }
}
