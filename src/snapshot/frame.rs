//! Per-participant frame history.

use tracing::debug;

use super::storage::SnapshotStorage;
use crate::core::{DELTA_WINDOW_SLACK, MAX_AREA_BYTES, PACKET_BACKUP, PACKET_MASK};
use crate::sync::PlayerState;

/// Ping reported while no frame has been acknowledged.
pub const MAX_PING: u32 = 999;

/// One snapshot as built for one participant.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantFrame {
    /// Outgoing message sequence the frame was built for.
    pub sequence: i32,
    /// Common frame the entity slots belong to.
    pub frame_num: u64,
    /// Simulation time of the tick.
    pub server_time: u32,
    /// Player state at build time.
    pub player_state: PlayerState,
    /// Bytes of `area_bits` carrying regions.
    pub area_bytes: usize,
    /// Inverted region visibility mask.
    pub area_bits: [u8; MAX_AREA_BYTES],
    /// Arena slots of visible entities, ascending by id.
    pub entity_slots: Vec<usize>,
    /// Host time the message carrying this frame was sent.
    pub message_sent: u64,
    /// Host time the frame was first acknowledged.
    pub message_acked: Option<u64>,
    /// Size of the message carrying this frame.
    pub message_size: usize,
}

/// Frames of the last [`PACKET_BACKUP`] outgoing messages.
#[derive(Debug, Clone)]
pub struct FrameRing {
    frames: Vec<Option<ParticipantFrame>>,
}

impl Default for FrameRing {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameRing {
    /// An empty ring.
    pub fn new() -> Self {
        Self {
            frames: vec![None; PACKET_BACKUP],
        }
    }

    /// Store a frame, replacing whatever occupied its slot.
    pub fn insert(&mut self, frame: ParticipantFrame) {
        let index = frame.sequence as usize & PACKET_MASK;
        self.frames[index] = Some(frame);
    }

    /// Frame built for `sequence`, if still retained.
    pub fn get(&self, sequence: i32) -> Option<&ParticipantFrame> {
        self.frames[sequence as usize & PACKET_MASK]
            .as_ref()
            .filter(|f| f.sequence == sequence)
    }

    /// Mutable access to the frame built for `sequence`.
    pub fn get_mut(&mut self, sequence: i32) -> Option<&mut ParticipantFrame> {
        self.frames[sequence as usize & PACKET_MASK]
            .as_mut()
            .filter(|f| f.sequence == sequence)
    }

    /// Record the first acknowledgment of `sequence`.
    pub fn acknowledge(&mut self, sequence: i32, now: u64) {
        if let Some(frame) = self.get_mut(sequence) {
            frame.message_acked.get_or_insert(now);
        }
    }

    /// Forget every frame.
    pub fn clear(&mut self) {
        self.frames.iter_mut().for_each(|f| *f = None);
    }

    /// Average round trip over acknowledged frames, capped at [`MAX_PING`].
    pub fn ping(&self) -> u32 {
        let (total, count) = self
            .frames
            .iter()
            .flatten()
            .filter_map(|f| f.message_acked.map(|acked| acked.saturating_sub(f.message_sent)))
            .fold((0u64, 0u64), |(t, c), rtt| (t + rtt, c + 1));
        if count == 0 {
            return MAX_PING;
        }
        ((total / count) as u32).min(MAX_PING)
    }

    /// Reference frame for a snapshot sent as `outgoing`, given the last
    /// message the participant acknowledged (`None` forces a full
    /// snapshot).
    ///
    /// Returns the offset written on the wire with the frame, or `None` if
    /// the snapshot must be sent against baselines.
    pub fn delta_reference<'a>(
        &'a self,
        storage: &SnapshotStorage,
        outgoing: i32,
        acknowledged: Option<i32>,
    ) -> Option<(u8, &'a ParticipantFrame)> {
        let delta = acknowledged?;
        let distance = outgoing.wrapping_sub(delta);
        if distance <= 0 || distance >= PACKET_BACKUP as i32 - DELTA_WINDOW_SLACK {
            debug!(outgoing, delta, "delta request from out of date packet");
            return None;
        }
        let Some(old) = self.get(delta) else {
            debug!(outgoing, delta, "delta reference not retained");
            return None;
        };
        if !storage.is_valid(old.frame_num) {
            debug!(
                frame = old.frame_num,
                last_valid = storage.last_valid_frame(),
                "delta request from out of date entities"
            );
            return None;
        }
        Some((distance as u8, old))
    }
}
