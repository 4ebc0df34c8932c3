//! Snapshot message encoding.
//!
//! ```text
//! Snapshot(7) serverTime:4 deltaNum:1 flags:1 areaBytes:1 areaBits
//!             playerDelta entityDelta* sentinel:2
//! ```
//!
//! Entities are written as a sorted merge of the reference frame and the
//! new frame: ids in both are diffed against the reference, new ids
//! against their baseline, vanished ids are removed.

use super::baseline::Baselines;
use super::frame::ParticipantFrame;
use super::storage::SnapshotStorage;
use crate::core::ENTITY_SENTINEL;
use crate::sync::{HostOp, MessageError, MessageWriter, write_delta_entity, write_delta_player};

/// Header fields not taken from the frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotHeader {
    /// Outgoing sequence minus the reference frame's, 0 for a full snapshot.
    pub delta_num: u8,
    /// `SNAPFLAG_*` bits.
    pub flags: u8,
}

const NO_ENTITY: u32 = u32::MAX;

/// Write the entity merge of `old` (or nothing) into `new`, ending with
/// the sentinel id.
pub fn write_packet_entities(
    w: &mut MessageWriter,
    storage: &SnapshotStorage,
    baselines: &Baselines,
    old: Option<&ParticipantFrame>,
    new: &ParticipantFrame,
) -> Result<(), MessageError> {
    let old_slots: &[usize] = old.map(|f| f.entity_slots.as_slice()).unwrap_or_default();
    let id_at = |slots: &[usize], i: usize| {
        slots
            .get(i)
            .map_or(NO_ENTITY, |&s| u32::from(storage.entity(s).number))
    };

    let (mut oi, mut ni) = (0, 0);
    loop {
        let old_id = id_at(old_slots, oi);
        let new_id = id_at(&new.entity_slots, ni);
        if old_id == NO_ENTITY && new_id == NO_ENTITY {
            break;
        }

        if new_id == old_id {
            let from = storage.entity(old_slots[oi]);
            let to = storage.entity(new.entity_slots[ni]);
            write_delta_entity(w, from, Some(to), false)?;
            oi += 1;
            ni += 1;
        } else if new_id < old_id {
            let to = storage.entity(new.entity_slots[ni]);
            let from = baselines.reference(to.number);
            write_delta_entity(w, &from, Some(to), true)?;
            ni += 1;
        } else {
            let from = storage.entity(old_slots[oi]);
            write_delta_entity(w, from, None, true)?;
            oi += 1;
        }
    }

    w.write_u16(ENTITY_SENTINEL);
    Ok(())
}

/// Write a complete snapshot of `frame`, delta compressed against `old`.
pub fn write_snapshot(
    w: &mut MessageWriter,
    storage: &SnapshotStorage,
    baselines: &Baselines,
    frame: &ParticipantFrame,
    old: Option<&ParticipantFrame>,
    header: SnapshotHeader,
) -> Result<(), MessageError> {
    w.write_host_op(HostOp::Snapshot);
    w.write_u32(frame.server_time);
    w.write_u8(if old.is_some() { header.delta_num } else { 0 });
    w.write_u8(header.flags);
    w.write_u8(frame.area_bytes as u8);
    w.write_bytes(&frame.area_bits[..frame.area_bytes]);
    write_delta_player(w, old.map(|f| &f.player_state), &frame.player_state);
    write_packet_entities(w, storage, baselines, old, frame)
}
