//! XOR obfuscation for legacy-protocol peers.
//!
//! The key starts from the connection challenge mixed with per-message
//! values and rolls through the bytes of the last reliable command both
//! sides know, so a peer that missed that command cannot decode the
//! message.

use crate::core::{HOST_ENCODE_START, USER_ENCODE_START};
use crate::sync::MessageReader;

fn xor_from(data: &mut [u8], start: usize, seed: i32, text: &str) {
    if data.len() <= start {
        return;
    }
    let text = text.as_bytes();
    let mut key = seed as u8;
    let mut index = 0;
    for (i, byte) in data.iter_mut().enumerate().skip(start) {
        // Wrap to the start of the string at its end.
        if index >= text.len() {
            index = 0;
        }
        let ch = match text.get(index) {
            Some(&c) if c > 127 || c == b'%' => b'.',
            Some(&c) => c,
            None => 0,
        };
        key ^= ch.wrapping_shl((i & 1) as u32);
        index += 1;
        *byte ^= key;
    }
}

/// Obfuscate (or restore) a host → participant message in place.
///
/// `sequence` is the channel sequence the message is sent under and
/// `last_user_command` the text of the last command executed from this
/// participant. Bytes before the reliable acknowledge stay clear.
pub fn host_encode(data: &mut [u8], challenge: i32, sequence: i32, last_user_command: &str) {
    xor_from(data, HOST_ENCODE_START, challenge ^ sequence, last_user_command);
}

/// Restore a host → participant message on the participant side.
///
/// `sent_command` is the text of this participant's own reliable command
/// at the acknowledge found in the first four bytes.
pub fn user_decode(data: &mut [u8], challenge: i32, sequence: i32, sent_command: &str) {
    host_encode(data, challenge, sequence, sent_command);
}

/// Obfuscate (or restore) a participant → host message in place.
///
/// The key mixes host id and message acknowledge from the clear header;
/// `host_command` is the host's reliable command at the acknowledged
/// sequence.
pub fn user_encode(data: &mut [u8], challenge: i32, host_command: &str) {
    let mut r = MessageReader::new(data);
    let (Ok(host_id), Ok(message_ack)) = (r.read_i32(), r.read_i32()) else {
        return;
    };
    xor_from(data, USER_ENCODE_START, challenge ^ host_id ^ message_ack, host_command);
}

/// Restore a participant → host message on the host side.
pub fn host_decode(data: &mut [u8], challenge: i32, host_command: &str) {
    user_encode(data, challenge, host_command);
}

/// Reliable acknowledge carried in the clear header of a participant
/// message.
pub fn user_reliable_ack(data: &[u8]) -> Option<i32> {
    let b = data.get(8..12)?;
    Some(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Reliable acknowledge carried in the clear header of a host message.
pub fn host_reliable_ack(data: &[u8]) -> Option<i32> {
    let b = data.get(0..4)?;
    Some(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}
