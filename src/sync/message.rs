//! Message buffers and op tags.
//!
//! All multi-byte integers are little-endian. Strings are NUL-terminated;
//! bytes above 127 and `%` are replaced with `.` when written.
//!
//! Host → participant message:
//! ```text
//! +0   Last executed user command (4 bytes LE32)
//! +4   (Command, sequence:4, string)*
//! ...  Gamestate | Snapshot | Download
//! ...  Eof
//! ```
//!
//! Participant → host message:
//! ```text
//! +0   Host id (4 bytes LE32)
//! +4   Message acknowledge (4 bytes LE32)
//! +8   Reliable acknowledge (4 bytes LE32)
//! +12  (Command, sequence:4, string)*
//! ...  Move | MoveNoDelta (count:1, user commands)
//! ...  Eof
//! ```

use thiserror::Error;

use crate::core::{BIG_INFO_STRING, MAX_STRING_CHARS};

/// Message tags written by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HostOp {
    /// Invalid.
    Bad = 0,
    /// Padding.
    Nop = 1,
    /// Full world state follows.
    Gamestate = 2,
    /// Broadcast-state entry inside a gamestate.
    Configstring = 3,
    /// Baseline entity inside a gamestate.
    Baseline = 4,
    /// Reliable command.
    Command = 5,
    /// Download block.
    Download = 6,
    /// Snapshot.
    Snapshot = 7,
    /// End of message.
    Eof = 8,
}

impl HostOp {
    /// Parse from wire byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Bad),
            1 => Some(Self::Nop),
            2 => Some(Self::Gamestate),
            3 => Some(Self::Configstring),
            4 => Some(Self::Baseline),
            5 => Some(Self::Command),
            6 => Some(Self::Download),
            7 => Some(Self::Snapshot),
            8 => Some(Self::Eof),
            _ => None,
        }
    }

    /// Wire byte.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Message tags written by participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UserOp {
    /// Invalid.
    Bad = 0,
    /// Padding.
    Nop = 1,
    /// Input commands; the host may delta against the acknowledged frame.
    Move = 2,
    /// Input commands; the participant requests a full snapshot.
    MoveNoDelta = 3,
    /// Reliable command.
    Command = 4,
    /// End of message.
    Eof = 5,
}

impl UserOp {
    /// Parse from wire byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Bad),
            1 => Some(Self::Nop),
            2 => Some(Self::Move),
            3 => Some(Self::MoveNoDelta),
            4 => Some(Self::Command),
            5 => Some(Self::Eof),
            _ => None,
        }
    }

    /// Wire byte.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Message encoding/decoding errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// Input data is shorter than required.
    #[error("message too short: expected {expected} bytes, got {actual}")]
    TooShort {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Writes exceeded the buffer limit.
    #[error("message overflow: {required} bytes exceeds limit of {available}")]
    Overflow {
        /// Bytes the writer tried to hold.
        required: usize,
        /// Buffer limit.
        available: usize,
    },

    /// Unknown op tag.
    #[error("unknown op {0}")]
    UnknownOp(u8),

    /// Entity number outside the id space.
    #[error("bad entity number {0}")]
    BadEntityNumber(u16),

    /// Structurally invalid content.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// Append-only message builder with a size limit.
///
/// Writes past the limit are discarded and latch the overflow flag;
/// [`finish`](Self::finish) reports it.
#[derive(Debug, Clone)]
pub struct MessageWriter {
    buf: Vec<u8>,
    limit: usize,
    overflowed: bool,
}

impl MessageWriter {
    /// Create a writer that holds at most `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit.min(4096)),
            limit,
            overflowed: false,
        }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if nothing was written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Size limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// True once any write was discarded.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Written bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Write raw bytes.
    pub fn write_bytes(&mut self, data: &[u8]) {
        if self.overflowed || self.buf.len() + data.len() > self.limit {
            self.overflowed = true;
            return;
        }
        self.buf.extend_from_slice(data);
    }

    /// Write one byte.
    pub fn write_u8(&mut self, v: u8) {
        self.write_bytes(&[v]);
    }

    /// Write a 2-byte value.
    pub fn write_u16(&mut self, v: u16) {
        self.write_bytes(&v.to_le_bytes());
    }

    /// Write a 4-byte unsigned value.
    pub fn write_u32(&mut self, v: u32) {
        self.write_bytes(&v.to_le_bytes());
    }

    /// Write a 4-byte signed value.
    pub fn write_i32(&mut self, v: i32) {
        self.write_bytes(&v.to_le_bytes());
    }

    /// Write a host op tag.
    pub fn write_host_op(&mut self, op: HostOp) {
        self.write_u8(op.as_byte());
    }

    /// Write a participant op tag.
    pub fn write_user_op(&mut self, op: UserOp) {
        self.write_u8(op.as_byte());
    }

    /// Write a command-sized string.
    pub fn write_string(&mut self, s: &str) {
        self.write_limited_string(s, MAX_STRING_CHARS);
    }

    /// Write a gamestate-sized string.
    pub fn write_big_string(&mut self, s: &str) {
        self.write_limited_string(s, BIG_INFO_STRING);
    }

    fn write_limited_string(&mut self, s: &str, max: usize) {
        let bytes = s.as_bytes();
        let len = bytes.len().min(max - 1);
        let mut out = Vec::with_capacity(len + 1);
        out.extend(bytes[..len].iter().map(|&b| sanitize_byte(b)));
        out.push(0);
        self.write_bytes(&out);
    }

    /// Raw access for in-place obfuscation.
    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Consume the writer, failing if any write overflowed.
    pub fn finish(self) -> Result<Vec<u8>, MessageError> {
        if self.overflowed {
            return Err(MessageError::Overflow {
                required: self.buf.len() + 1,
                available: self.limit,
            });
        }
        Ok(self.buf)
    }
}

/// Strings may not carry bytes above 127 or `%`.
pub(crate) fn sanitize_byte(b: u8) -> u8 {
    if b > 127 || b == b'%' { b'.' } else { b }
}

/// Cursor over a received message.
#[derive(Debug, Clone)]
pub struct MessageReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> MessageReader<'a> {
    /// Start reading at the beginning of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], MessageError> {
        if self.remaining() < n {
            return Err(MessageError::TooShort {
                expected: self.pos + n,
                actual: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Read raw bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], MessageError> {
        self.take(n)
    }

    /// Read one byte.
    pub fn read_u8(&mut self) -> Result<u8, MessageError> {
        Ok(self.take(1)?[0])
    }

    /// Read a 2-byte value.
    pub fn read_u16(&mut self) -> Result<u16, MessageError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Read a 4-byte unsigned value.
    pub fn read_u32(&mut self) -> Result<u32, MessageError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a 4-byte signed value.
    pub fn read_i32(&mut self) -> Result<i32, MessageError> {
        Ok(self.read_u32()? as i32)
    }

    /// Read a NUL-terminated string. A missing terminator ends at the
    /// message end.
    pub fn read_string(&mut self) -> Result<String, MessageError> {
        let rest = &self.data[self.pos..];
        let len = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let s = String::from_utf8_lossy(&rest[..len]).into_owned();
        self.pos += (len + 1).min(rest.len());
        Ok(s)
    }

    /// Read a host op tag. Running out of data reads as `Eof`.
    pub fn read_host_op(&mut self) -> Result<HostOp, MessageError> {
        if self.remaining() == 0 {
            return Ok(HostOp::Eof);
        }
        let b = self.read_u8()?;
        HostOp::from_byte(b).ok_or(MessageError::UnknownOp(b))
    }

    /// Read a participant op tag. Running out of data reads as `Eof`.
    pub fn read_user_op(&mut self) -> Result<UserOp, MessageError> {
        if self.remaining() == 0 {
            return Ok(UserOp::Eof);
        }
        let b = self.read_u8()?;
        UserOp::from_byte(b).ok_or(MessageError::UnknownOp(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integers_little_endian() {
        let mut w = MessageWriter::new(64);
        w.write_u8(0xAB);
        w.write_u16(0x1234);
        w.write_i32(-2);
        let bytes = w.finish().unwrap();
        assert_eq!(hex::encode(&bytes), "ab3412feffffff");

        let mut r = MessageReader::new(&bytes);
        assert_eq!(r.read_u8().unwrap(), 0xAB);
        assert_eq!(r.read_u16().unwrap(), 0x1234);
        assert_eq!(r.read_i32().unwrap(), -2);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_string_sanitized() {
        let mut w = MessageWriter::new(64);
        w.write_string("100% ok\u{e9}");
        let bytes = w.finish().unwrap();
        let mut r = MessageReader::new(&bytes);
        // The two-byte UTF-8 sequence becomes two dots.
        assert_eq!(r.read_string().unwrap(), "100. ok..");
    }

    #[test]
    fn test_overflow_latches() {
        let mut w = MessageWriter::new(4);
        w.write_u32(1);
        assert!(!w.overflowed());
        w.write_u8(2);
        assert!(w.overflowed());
        assert!(matches!(w.finish(), Err(MessageError::Overflow { .. })));
    }

    #[test]
    fn test_read_too_short() {
        let mut r = MessageReader::new(&[1, 2]);
        assert_eq!(
            r.read_u32(),
            Err(MessageError::TooShort {
                expected: 4,
                actual: 2
            })
        );
    }

    #[test]
    fn test_op_tags() {
        for b in 0..=8u8 {
            assert_eq!(HostOp::from_byte(b).unwrap().as_byte(), b);
        }
        assert_eq!(HostOp::from_byte(9), None);
        assert_eq!(UserOp::from_byte(5), Some(UserOp::Eof));
        assert_eq!(UserOp::from_byte(6), None);

        let mut r = MessageReader::new(&[]);
        assert_eq!(r.read_host_op().unwrap(), HostOp::Eof);
    }

    #[test]
    fn test_unterminated_string() {
        let mut r = MessageReader::new(b"abc");
        assert_eq!(r.read_string().unwrap(), "abc");
        assert_eq!(r.remaining(), 0);
    }
}
