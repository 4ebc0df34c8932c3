//! Entity state and its delta encoding.
//!
//! Each entity delta is prefixed with its id and a control byte:
//! ```text
//! +0   Entity number (2 bytes LE16)
//! +2   Control (1 byte): 0 unchanged, 1 removed, 2 changed
//! +3   Field delta (changed only, see `delta`)
//! ```
//! An unchanged entity produces no bytes at all unless forced.

use super::delta::{read_delta, write_delta};
use super::message::{MessageError, MessageReader, MessageWriter};
use crate::core::{DeltaState, MAX_ENTITIES};

const CONTROL_UNCHANGED: u8 = 0;
const CONTROL_REMOVED: u8 = 1;
const CONTROL_CHANGED: u8 = 2;

/// The replicated part of a simulation entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityState {
    /// Entity id, `0..MAX_ENTITIES - 1`.
    pub number: u16,
    /// Simulation-defined entity kind.
    pub kind: u8,
    /// Simulation-defined flag bits.
    pub flags: u32,
    /// Position.
    pub origin: [f32; 3],
    /// Secondary position (portal camera, beam end).
    pub origin2: [f32; 3],
    /// Orientation.
    pub angles: [f32; 3],
    /// Linear velocity for extrapolation.
    pub velocity: [f32; 3],
    /// Time base for extrapolation.
    pub time: u32,
    /// Primary model.
    pub model_index: u16,
    /// Secondary model.
    pub model_index2: u16,
    /// Animation frame.
    pub frame: u16,
    /// Transient event id.
    pub event: u16,
    /// Event parameter.
    pub event_param: u16,
    /// Packed collision bounds.
    pub solid: u32,
    /// Related entity.
    pub other_entity: u16,
    /// Entity standing on.
    pub ground_entity: u16,
    /// Owning participant slot.
    pub participant: u8,
    /// Held item.
    pub weapon: u8,
    /// Lower-body animation.
    pub legs_anim: u16,
    /// Upper-body animation.
    pub torso_anim: u16,
    /// Simulation-defined extra value (portal range on portal entities).
    pub generic1: u8,
}

impl DeltaState for EntityState {
    const FIELD_WIDTHS: &'static [u8] = &[
        1, 4, // kind, flags
        4, 4, 4, // origin
        4, 4, 4, // origin2
        4, 4, 4, // angles
        4, 4, 4, // velocity
        4, // time
        2, 2, 2, // model_index, model_index2, frame
        2, 2, // event, event_param
        4, // solid
        2, 2, // other_entity, ground_entity
        1, 1, // participant, weapon
        2, 2, // legs_anim, torso_anim
        1, // generic1
    ];

    fn field(&self, index: usize) -> u32 {
        match index {
            0 => self.kind as u32,
            1 => self.flags,
            2..=4 => self.origin[index - 2].to_bits(),
            5..=7 => self.origin2[index - 5].to_bits(),
            8..=10 => self.angles[index - 8].to_bits(),
            11..=13 => self.velocity[index - 11].to_bits(),
            14 => self.time,
            15 => self.model_index as u32,
            16 => self.model_index2 as u32,
            17 => self.frame as u32,
            18 => self.event as u32,
            19 => self.event_param as u32,
            20 => self.solid,
            21 => self.other_entity as u32,
            22 => self.ground_entity as u32,
            23 => self.participant as u32,
            24 => self.weapon as u32,
            25 => self.legs_anim as u32,
            26 => self.torso_anim as u32,
            27 => self.generic1 as u32,
            _ => 0,
        }
    }

    fn set_field(&mut self, index: usize, value: u32) {
        match index {
            0 => self.kind = value as u8,
            1 => self.flags = value,
            2..=4 => self.origin[index - 2] = f32::from_bits(value),
            5..=7 => self.origin2[index - 5] = f32::from_bits(value),
            8..=10 => self.angles[index - 8] = f32::from_bits(value),
            11..=13 => self.velocity[index - 11] = f32::from_bits(value),
            14 => self.time = value,
            15 => self.model_index = value as u16,
            16 => self.model_index2 = value as u16,
            17 => self.frame = value as u16,
            18 => self.event = value as u16,
            19 => self.event_param = value as u16,
            20 => self.solid = value,
            21 => self.other_entity = value as u16,
            22 => self.ground_entity = value as u16,
            23 => self.participant = value as u8,
            24 => self.weapon = value as u8,
            25 => self.legs_anim = value as u16,
            26 => self.torso_anim = value as u16,
            27 => self.generic1 = value as u8,
            _ => {}
        }
    }
}

impl EntityState {
    /// An empty state carrying only an id. Deltas for entities without a
    /// baseline are taken against this.
    pub fn null(number: u16) -> Self {
        Self {
            number,
            ..Self::default()
        }
    }
}

/// Write the delta from `from` to `to`.
///
/// `to == None` removes `from.number`. With `force` an unchanged entity
/// still emits its id; without it an unchanged entity emits nothing.
pub fn write_delta_entity(
    w: &mut MessageWriter,
    from: &EntityState,
    to: Option<&EntityState>,
    force: bool,
) -> Result<(), MessageError> {
    let Some(to) = to else {
        w.write_u16(from.number);
        w.write_u8(CONTROL_REMOVED);
        return Ok(());
    };

    if to.number as usize >= MAX_ENTITIES - 1 {
        return Err(MessageError::BadEntityNumber(to.number));
    }

    if to.last_changed_field(from).is_none() {
        if force {
            w.write_u16(to.number);
            w.write_u8(CONTROL_UNCHANGED);
        }
        return Ok(());
    }

    w.write_u16(to.number);
    w.write_u8(CONTROL_CHANGED);
    write_delta(w, from, to);
    Ok(())
}

/// Read one entity delta whose id has already been read.
///
/// Returns `None` when the entity was removed.
pub fn read_delta_entity(
    r: &mut MessageReader<'_>,
    from: &EntityState,
    number: u16,
) -> Result<Option<EntityState>, MessageError> {
    if number as usize >= MAX_ENTITIES - 1 {
        return Err(MessageError::BadEntityNumber(number));
    }
    match r.read_u8()? {
        CONTROL_REMOVED => Ok(None),
        CONTROL_UNCHANGED => {
            let mut to = from.clone();
            to.number = number;
            Ok(Some(to))
        }
        CONTROL_CHANGED => {
            let mut to = read_delta(r, from)?;
            to.number = number;
            Ok(Some(to))
        }
        other => Err(MessageError::InvalidFormat(format!(
            "bad entity control byte {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn moving(number: u16, x: f32) -> EntityState {
        EntityState {
            number,
            kind: 1,
            origin: [x, 0.0, 64.0],
            model_index: 3,
            ..EntityState::default()
        }
    }

    #[test]
    fn test_unchanged_emits_nothing() {
        let e = moving(5, 10.0);
        let mut w = MessageWriter::new(64);
        write_delta_entity(&mut w, &e, Some(&e), false).unwrap();
        assert!(w.is_empty());
    }

    #[test]
    fn test_forced_unchanged_emits_id() {
        let e = moving(5, 10.0);
        let mut w = MessageWriter::new(64);
        write_delta_entity(&mut w, &e, Some(&e), true).unwrap();
        assert_eq!(w.as_bytes(), &[5, 0, CONTROL_UNCHANGED]);

        let bytes = w.finish().unwrap();
        let mut r = MessageReader::new(&bytes);
        let number = r.read_u16().unwrap();
        assert_eq!(read_delta_entity(&mut r, &e, number).unwrap(), Some(e));
    }

    #[test]
    fn test_removal() {
        let e = moving(9, 1.0);
        let mut w = MessageWriter::new(64);
        write_delta_entity(&mut w, &e, None, false).unwrap();
        let bytes = w.finish().unwrap();

        let mut r = MessageReader::new(&bytes);
        let number = r.read_u16().unwrap();
        assert_eq!(number, 9);
        assert_eq!(read_delta_entity(&mut r, &e, number).unwrap(), None);
    }

    #[test]
    fn test_delta_from_null_reconstructs() {
        let to = moving(12, -32.5);
        let mut w = MessageWriter::new(256);
        write_delta_entity(&mut w, &EntityState::null(12), Some(&to), true).unwrap();
        let bytes = w.finish().unwrap();

        let mut r = MessageReader::new(&bytes);
        let number = r.read_u16().unwrap();
        let got = read_delta_entity(&mut r, &EntityState::null(number), number).unwrap();
        assert_eq!(got, Some(to));
    }

    #[test]
    fn test_sentinel_number_rejected() {
        let mut e = moving(0, 0.0);
        e.number = (MAX_ENTITIES - 1) as u16;
        let mut w = MessageWriter::new(64);
        assert_eq!(
            write_delta_entity(&mut w, &EntityState::default(), Some(&e), false),
            Err(MessageError::BadEntityNumber(e.number))
        );
    }

    #[test]
    fn test_field_table_matches_accessors() {
        assert_eq!(EntityState::field_count(), 28);
        let mut e = EntityState::default();
        for i in 0..EntityState::field_count() {
            e.set_field(i, i as u32 + 1);
        }
        for i in 0..EntityState::field_count() {
            assert_eq!(e.field(i), i as u32 + 1);
        }
    }

    #[test]
    fn test_field_types_hold_wire_width() {
        let mut e = EntityState::default();
        for (i, width) in EntityState::FIELD_WIDTHS.iter().enumerate() {
            let max = u32::MAX >> (32 - 8 * u32::from(*width));
            e.set_field(i, max);
            assert_eq!(e.field(i), max, "field {i}");
        }
    }

    fn arb_entity(number: u16) -> impl Strategy<Value = EntityState> {
        let motion = (
            any::<u32>(),
            prop::array::uniform3(-8192.0f32..8192.0),
            prop::array::uniform3(-8192.0f32..8192.0),
            prop::array::uniform3(-360.0f32..360.0),
            prop::array::uniform3(-800.0f32..800.0),
            any::<u32>(),
            any::<u32>(),
        );
        let models = (
            any::<u8>(),
            any::<u16>(),
            any::<u16>(),
            any::<u16>(),
            any::<u16>(),
            any::<u16>(),
            any::<u16>(),
            any::<u16>(),
        );
        let owner = (any::<u8>(), any::<u8>(), any::<u16>(), any::<u16>(), any::<u8>());
        (motion, models, owner).prop_map(
            move |(
                (flags, origin, origin2, angles, velocity, time, solid),
                (kind, model_index, model_index2, frame, event, event_param, other_entity, ground_entity),
                (participant, weapon, legs_anim, torso_anim, generic1),
            )| EntityState {
                number,
                kind,
                flags,
                origin,
                origin2,
                angles,
                velocity,
                time,
                model_index,
                model_index2,
                frame,
                event,
                event_param,
                solid,
                other_entity,
                ground_entity,
                participant,
                weapon,
                legs_anim,
                torso_anim,
                generic1,
            },
        )
    }

    proptest! {
        #[test]
        fn test_delta_reproduces_target(from in arb_entity(17), to in arb_entity(17)) {
            let mut w = MessageWriter::new(1024);
            write_delta_entity(&mut w, &from, Some(&to), true).unwrap();
            let bytes = w.finish().unwrap();
            let mut r = MessageReader::new(&bytes);
            let number = r.read_u16().unwrap();
            prop_assert_eq!(read_delta_entity(&mut r, &from, number).unwrap(), Some(to));
            prop_assert_eq!(r.remaining(), 0);
        }
    }
}
