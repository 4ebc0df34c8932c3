//! Participant input commands.
//!
//! A move carries `count:1` commands, each delta-coded against the one
//! before it; the first is coded against the empty command.

use super::delta::{read_delta, write_delta};
use super::message::{MessageError, MessageReader, MessageWriter};
use crate::core::DeltaState;

/// Most input commands carried by one packet.
pub const MAX_PACKET_USERCMDS: usize = 32;

/// One tick of participant input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserCmd {
    /// Host time the command was generated for.
    pub server_time: u32,
    /// View angles in 1/65536 turns.
    pub angles: [u16; 3],
    /// Button bits.
    pub buttons: u32,
    /// Selected item.
    pub weapon: u8,
    /// Forward movement.
    pub forward: i8,
    /// Sideways movement.
    pub right: i8,
    /// Vertical movement.
    pub up: i8,
}

impl DeltaState for UserCmd {
    const FIELD_WIDTHS: &'static [u8] = &[4, 2, 2, 2, 4, 1, 1, 1, 1];

    fn field(&self, index: usize) -> u32 {
        match index {
            0 => self.server_time,
            1..=3 => self.angles[index - 1] as u32,
            4 => self.buttons,
            5 => self.weapon as u32,
            6 => self.forward as u8 as u32,
            7 => self.right as u8 as u32,
            8 => self.up as u8 as u32,
            _ => 0,
        }
    }

    fn set_field(&mut self, index: usize, value: u32) {
        match index {
            0 => self.server_time = value,
            1..=3 => self.angles[index - 1] = value as u16,
            4 => self.buttons = value,
            5 => self.weapon = value as u8,
            6 => self.forward = value as u8 as i8,
            7 => self.right = value as u8 as i8,
            8 => self.up = value as u8 as i8,
            _ => {}
        }
    }
}

/// Write a batch of commands.
pub fn write_usercmds(w: &mut MessageWriter, cmds: &[UserCmd]) {
    let cmds = &cmds[..cmds.len().min(MAX_PACKET_USERCMDS)];
    w.write_u8(cmds.len() as u8);
    let mut prev = UserCmd::default();
    for cmd in cmds {
        write_delta(w, &prev, cmd);
        prev = *cmd;
    }
}

/// Read a batch of commands.
pub fn read_usercmds(r: &mut MessageReader<'_>) -> Result<Vec<UserCmd>, MessageError> {
    let count = r.read_u8()? as usize;
    if count == 0 || count > MAX_PACKET_USERCMDS {
        return Err(MessageError::InvalidFormat(format!(
            "user command count {count}"
        )));
    }
    let mut cmds = Vec::with_capacity(count);
    let mut prev = UserCmd::default();
    for _ in 0..count {
        prev = read_delta(r, &prev)?;
        cmds.push(prev);
    }
    Ok(cmds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_chains_deltas() {
        let a = UserCmd {
            server_time: 1000,
            forward: -127,
            ..UserCmd::default()
        };
        let b = UserCmd {
            server_time: 1016,
            ..a
        };
        let mut w = MessageWriter::new(128);
        write_usercmds(&mut w, &[a, b]);
        let bytes = w.finish().unwrap();

        let mut r = MessageReader::new(&bytes);
        assert_eq!(read_usercmds(&mut r).unwrap(), vec![a, b]);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_empty_batch_rejected() {
        let mut r = MessageReader::new(&[0]);
        assert!(read_usercmds(&mut r).is_err());
    }
}
