//! Per-participant player state and its delta encoding.
//!
//! Scalars use the field delta from `delta`; the stat arrays follow as
//! `arrays:1` (bit 0 stats, bit 1 persistent) and for each present array a
//! `mask:2` plus one 4-byte value per set bit.

use super::delta::{read_delta, write_delta};
use super::message::{MessageError, MessageReader, MessageWriter};
use crate::core::DeltaState;

/// Entries in each stat array.
pub const MAX_STATS: usize = 16;

/// The state of the entity a participant controls, sent in every snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerState {
    /// Time of the last executed input command.
    pub command_time: u32,
    /// Movement mode.
    pub pm_type: u8,
    /// Movement flags.
    pub pm_flags: u16,
    /// Movement timer.
    pub pm_time: u16,
    /// Position.
    pub origin: [f32; 3],
    /// Velocity.
    pub velocity: [f32; 3],
    /// View angles.
    pub view_angles: [f32; 3],
    /// Eye height above origin (two's complement bits).
    pub view_height: u32,
    /// Entity standing on.
    pub ground_entity: u16,
    /// Participant slot; also the id of the participant's own entity.
    pub participant: u8,
    /// Held item.
    pub weapon: u8,
    /// Held item state.
    pub weapon_state: u8,
    /// Transient event counter.
    pub event_sequence: u16,
    /// Event raised outside prediction.
    pub external_event: u16,
    /// Simulation-defined stats.
    pub stats: [i32; MAX_STATS],
    /// Stats that survive respawns.
    pub persistent: [i32; MAX_STATS],
}

impl DeltaState for PlayerState {
    const FIELD_WIDTHS: &'static [u8] = &[
        4, 1, 2, 2, // command_time, pm_type, pm_flags, pm_time
        4, 4, 4, // origin
        4, 4, 4, // velocity
        4, 4, 4, // view_angles
        4, 2, 1, // view_height, ground_entity, participant
        1, 1, // weapon, weapon_state
        2, 2, // event_sequence, external_event
    ];

    fn field(&self, index: usize) -> u32 {
        match index {
            0 => self.command_time,
            1 => self.pm_type as u32,
            2 => self.pm_flags as u32,
            3 => self.pm_time as u32,
            4..=6 => self.origin[index - 4].to_bits(),
            7..=9 => self.velocity[index - 7].to_bits(),
            10..=12 => self.view_angles[index - 10].to_bits(),
            13 => self.view_height,
            14 => self.ground_entity as u32,
            15 => self.participant as u32,
            16 => self.weapon as u32,
            17 => self.weapon_state as u32,
            18 => self.event_sequence as u32,
            19 => self.external_event as u32,
            _ => 0,
        }
    }

    fn set_field(&mut self, index: usize, value: u32) {
        match index {
            0 => self.command_time = value,
            1 => self.pm_type = value as u8,
            2 => self.pm_flags = value as u16,
            3 => self.pm_time = value as u16,
            4..=6 => self.origin[index - 4] = f32::from_bits(value),
            7..=9 => self.velocity[index - 7] = f32::from_bits(value),
            10..=12 => self.view_angles[index - 10] = f32::from_bits(value),
            13 => self.view_height = value,
            14 => self.ground_entity = value as u16,
            15 => self.participant = value as u8,
            16 => self.weapon = value as u8,
            17 => self.weapon_state = value as u8,
            18 => self.event_sequence = value as u16,
            19 => self.external_event = value as u16,
            _ => {}
        }
    }
}

impl PlayerState {
    /// Eye position used as the visibility origin.
    pub fn eye(&self) -> [f32; 3] {
        [
            self.origin[0],
            self.origin[1],
            self.origin[2] + self.view_height as i32 as f32,
        ]
    }
}

/// Write the delta from `from` (or the empty state) to `to`.
pub fn write_delta_player(w: &mut MessageWriter, from: Option<&PlayerState>, to: &PlayerState) {
    let empty = PlayerState::default();
    let from = from.unwrap_or(&empty);

    write_delta(w, from, to);

    let stats = array_mask(&from.stats, &to.stats);
    let persistent = array_mask(&from.persistent, &to.persistent);
    let present = u8::from(stats != 0) | (u8::from(persistent != 0) << 1);
    w.write_u8(present);
    for (mask, values) in [(stats, &to.stats), (persistent, &to.persistent)] {
        if mask == 0 {
            continue;
        }
        w.write_u16(mask);
        for (i, v) in values.iter().enumerate() {
            if mask & (1 << i) != 0 {
                w.write_i32(*v);
            }
        }
    }
}

/// Read a player state delta on top of `from` (or the empty state).
pub fn read_delta_player(
    r: &mut MessageReader<'_>,
    from: Option<&PlayerState>,
) -> Result<PlayerState, MessageError> {
    let empty = PlayerState::default();
    let mut to = read_delta(r, from.unwrap_or(&empty))?;

    let present = r.read_u8()?;
    if present & 1 != 0 {
        read_array(r, &mut to.stats)?;
    }
    if present & 2 != 0 {
        read_array(r, &mut to.persistent)?;
    }
    Ok(to)
}

fn array_mask(from: &[i32; MAX_STATS], to: &[i32; MAX_STATS]) -> u16 {
    from.iter()
        .zip(to)
        .enumerate()
        .filter(|(_, (a, b))| a != b)
        .fold(0u16, |mask, (i, _)| mask | (1 << i))
}

fn read_array(r: &mut MessageReader<'_>, values: &mut [i32; MAX_STATS]) -> Result<(), MessageError> {
    let mask = r.read_u16()?;
    for (i, v) in values.iter_mut().enumerate() {
        if mask & (1 << i) != 0 {
            *v = r.read_i32()?;
        }
    }
    Ok(())
}
