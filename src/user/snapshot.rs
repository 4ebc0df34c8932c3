//! Snapshot decoding and the retained history deltas refer back to.

use tracing::debug;

use crate::core::{ENTITY_SENTINEL, PACKET_BACKUP, SNAPFLAG_NOT_ACTIVE, SNAPFLAG_RATE_DELAYED};
use crate::snapshot::Baselines;
use crate::sync::{EntityState, MessageError, MessageReader, PlayerState, read_delta_entity, read_delta_player};

/// A decoded snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct UserSnapshot {
    /// Channel sequence the snapshot arrived in.
    pub message_num: i32,
    /// Host simulation time.
    pub server_time: u32,
    /// `SNAPFLAG_*` bits.
    pub flags: u8,
    /// Connected-area mask.
    pub area_bits: Vec<u8>,
    /// The participant's own state.
    pub player_state: PlayerState,
    /// Visible entities, ascending by id.
    pub entities: Vec<EntityState>,
    /// Sequence of the snapshot this one was delta coded from.
    pub delta_from: Option<i32>,
}

impl UserSnapshot {
    /// Entity `number`, if visible.
    pub fn entity(&self, number: u16) -> Option<&EntityState> {
        self.entities
            .binary_search_by_key(&number, |e| e.number)
            .ok()
            .map(|i| &self.entities[i])
    }

    /// The host skipped at least one snapshot for bandwidth.
    pub fn rate_delayed(&self) -> bool {
        self.flags & SNAPFLAG_RATE_DELAYED != 0
    }

    /// The host does not consider the participant in the world yet.
    pub fn not_active(&self) -> bool {
        self.flags & SNAPFLAG_NOT_ACTIVE != 0
    }
}

/// Recent snapshots by message sequence.
#[derive(Debug, Clone)]
pub struct SnapshotHistory {
    slots: Vec<Option<UserSnapshot>>,
}

impl Default for SnapshotHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotHistory {
    /// Empty history.
    pub fn new() -> Self {
        Self {
            slots: vec![None; PACKET_BACKUP],
        }
    }

    /// Snapshot received in message `sequence`, if still held.
    pub fn get(&self, sequence: i32) -> Option<&UserSnapshot> {
        self.slots[slot(sequence)]
            .as_ref()
            .filter(|s| s.message_num == sequence)
    }

    /// Keep `snapshot`, replacing whatever shared its slot.
    pub fn insert(&mut self, snapshot: UserSnapshot) {
        let i = slot(snapshot.message_num);
        self.slots[i] = Some(snapshot);
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }
}

fn slot(sequence: i32) -> usize {
    (sequence as u32 as usize) % PACKET_BACKUP
}

/// Decode the body of a snapshot op received in `message_num`.
///
/// Returns `Ok(None)` when the snapshot deltas from a message no longer
/// held; the body is still consumed so the rest of the message parses.
pub fn read_snapshot(
    r: &mut MessageReader<'_>,
    message_num: i32,
    history: &SnapshotHistory,
    baselines: &Baselines,
) -> Result<Option<UserSnapshot>, MessageError> {
    let server_time = r.read_u32()?;
    let delta_num = r.read_u8()?;
    let flags = r.read_u8()?;
    let area_len = r.read_u8()? as usize;
    let area_bits = r.read_bytes(area_len)?.to_vec();

    let delta_from = (delta_num != 0).then(|| message_num.wrapping_sub(i32::from(delta_num)));
    let old = delta_from.and_then(|seq| history.get(seq));
    let valid = delta_from.is_none() || old.is_some();
    if !valid {
        debug!(message_num, delta_num, "delta from a snapshot no longer held");
    }

    let player_state = read_delta_player(r, old.map(|s| &s.player_state))?;
    let old_entities = old.map_or(&[][..], |s| s.entities.as_slice());
    let entities = read_packet_entities(r, old_entities, baselines)?;

    Ok(valid.then_some(UserSnapshot {
        message_num,
        server_time,
        flags,
        area_bits,
        player_state,
        entities,
        delta_from,
    }))
}

/// Merge an entity run against `old`, new ids against their baseline.
pub fn read_packet_entities(
    r: &mut MessageReader<'_>,
    old: &[EntityState],
    baselines: &Baselines,
) -> Result<Vec<EntityState>, MessageError> {
    let mut out = Vec::with_capacity(old.len());
    let mut old = old.iter().peekable();
    loop {
        let number = r.read_u16()?;
        if number == ENTITY_SENTINEL {
            break;
        }
        // Unmentioned entities carry over unchanged.
        while let Some(prev) = old.next_if(|e| e.number < number) {
            out.push(prev.clone());
        }
        let decoded = match old.next_if(|e| e.number == number) {
            Some(prev) => read_delta_entity(r, prev, number)?,
            None => read_delta_entity(r, &baselines.reference(number), number)?,
        };
        out.extend(decoded);
    }
    out.extend(old.cloned());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MAX_AREA_BYTES;
    use crate::snapshot::{
        CommonFrame, ParticipantFrame, SnapshotHeader, SnapshotStorage, write_packet_entities, write_snapshot,
    };
    use crate::sync::{HostOp, MessageWriter};

    fn state(number: u16, x: f32) -> EntityState {
        EntityState {
            number,
            origin: [x, 0.0, 0.0],
            ..EntityState::default()
        }
    }

    fn frame(sequence: i32, storage: &mut SnapshotStorage, states: &[EntityState]) -> ParticipantFrame {
        let common: CommonFrame = storage.build(states).unwrap();
        ParticipantFrame {
            sequence,
            frame_num: common.frame_num,
            server_time: 500 + sequence as u32,
            player_state: PlayerState {
                command_time: sequence as u32,
                ..PlayerState::default()
            },
            area_bytes: 2,
            area_bits: [0; MAX_AREA_BYTES],
            entity_slots: (0..common.count).map(|i| storage.slot(&common, i)).collect(),
            message_sent: 0,
            message_acked: None,
            message_size: 0,
        }
    }

    fn encode(
        storage: &SnapshotStorage,
        baselines: &Baselines,
        new: &ParticipantFrame,
        old: Option<&ParticipantFrame>,
    ) -> Vec<u8> {
        let mut w = MessageWriter::new(16384);
        let header = SnapshotHeader {
            delta_num: old.map_or(0, |o| (new.sequence - o.sequence) as u8),
            flags: 0,
        };
        write_snapshot(&mut w, storage, baselines, new, old, header).unwrap();
        w.finish().unwrap()
    }

    fn decode(data: &[u8], message_num: i32, history: &SnapshotHistory, baselines: &Baselines) -> Option<UserSnapshot> {
        let mut r = MessageReader::new(data);
        assert_eq!(r.read_host_op().unwrap(), HostOp::Snapshot);
        let snap = read_snapshot(&mut r, message_num, history, baselines).unwrap();
        assert_eq!(r.remaining(), 0);
        snap
    }

    #[test]
    fn test_full_then_delta() {
        let mut storage = SnapshotStorage::new(4096);
        let mut baselines = Baselines::new();
        baselines.set(state(3, 1.0));
        let mut history = SnapshotHistory::new();

        let first = frame(1, &mut storage, &[state(3, 1.0), state(7, 2.0)]);
        let snap = decode(&encode(&storage, &baselines, &first, None), 1, &history, &baselines).unwrap();
        assert_eq!(snap.delta_from, None);
        assert_eq!(snap.entities, vec![state(3, 1.0), state(7, 2.0)]);
        assert_eq!(snap.player_state.command_time, 1);
        history.insert(snap);

        // Entity 3 moves, 7 vanishes, 9 appears.
        let second = frame(2, &mut storage, &[state(3, 5.0), state(9, 4.0)]);
        let data = encode(&storage, &baselines, &second, Some(&first));
        let snap = decode(&data, 2, &history, &baselines).unwrap();
        assert_eq!(snap.delta_from, Some(1));
        assert_eq!(snap.entities, vec![state(3, 5.0), state(9, 4.0)]);
        assert_eq!(snap.entity(9), Some(&state(9, 4.0)));
        assert_eq!(snap.entity(7), None);
    }

    #[test]
    fn test_delta_from_missing_snapshot_is_discarded() {
        let mut storage = SnapshotStorage::new(4096);
        let baselines = Baselines::new();
        let history = SnapshotHistory::new();

        let first = frame(1, &mut storage, &[state(2, 1.0)]);
        let second = frame(2, &mut storage, &[state(2, 3.0)]);
        let data = encode(&storage, &baselines, &second, Some(&first));
        assert!(decode(&data, 2, &history, &baselines).is_none());
    }

    #[test]
    fn test_unchanged_entities_carry_over() {
        let mut storage = SnapshotStorage::new(4096);
        let baselines = Baselines::new();
        let old = frame(1, &mut storage, &[state(1, 1.0), state(4, 4.0), state(6, 6.0)]);
        let new = frame(2, &mut storage, &[state(1, 1.0), state(4, 8.0), state(6, 6.0)]);

        let mut w = MessageWriter::new(1024);
        write_packet_entities(&mut w, &storage, &baselines, Some(&old), &new).unwrap();
        let data = w.finish().unwrap();
        let mut r = MessageReader::new(&data);
        let entities = read_packet_entities(&mut r, &[state(1, 1.0), state(4, 4.0), state(6, 6.0)], &baselines).unwrap();
        assert_eq!(entities, vec![state(1, 1.0), state(4, 8.0), state(6, 6.0)]);
    }

    #[test]
    fn test_history_keyed_by_sequence() {
        let mut history = SnapshotHistory::new();
        let snap = UserSnapshot {
            message_num: 5,
            server_time: 0,
            flags: SNAPFLAG_RATE_DELAYED,
            area_bits: Vec::new(),
            player_state: PlayerState::default(),
            entities: Vec::new(),
            delta_from: None,
        };
        assert!(snap.rate_delayed());
        assert!(!snap.not_active());
        history.insert(snap);
        assert!(history.get(5).is_some());
        assert!(history.get(5 + PACKET_BACKUP as i32).is_none());
        history.clear();
        assert!(history.get(5).is_none());
    }
}
