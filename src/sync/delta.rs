//! Field-wise delta coding for [`DeltaState`] records.
//!
//! Wire format:
//! ```text
//! +0   Changed-field span n (1 byte): fields [0, n) may differ
//! +1   Change mask (ceil(n / 8) bytes, bit i = field i changed)
//! ...  Values of changed fields, each FIELD_WIDTHS[i] bytes LE
//! ```
//! A span of zero means "no change" and carries nothing else.

use super::message::{MessageError, MessageReader, MessageWriter};
use crate::core::DeltaState;

/// Write the changes from `from` to `to`.
pub fn write_delta<T: DeltaState>(w: &mut MessageWriter, from: &T, to: &T) {
    let span = to.last_changed_field(from).map_or(0, |i| i + 1);
    w.write_u8(span as u8);
    if span == 0 {
        return;
    }

    let mut mask = vec![0u8; span.div_ceil(8)];
    for i in 0..span {
        if to.field(i) != from.field(i) {
            mask[i / 8] |= 1 << (i % 8);
        }
    }
    w.write_bytes(&mask);

    for i in 0..span {
        if mask[i / 8] & (1 << (i % 8)) != 0 {
            write_field(w, T::FIELD_WIDTHS[i], to.field(i));
        }
    }
}

/// Read changes and apply them on top of `from`.
pub fn read_delta<T: DeltaState>(r: &mut MessageReader<'_>, from: &T) -> Result<T, MessageError> {
    let span = r.read_u8()? as usize;
    let mut to = from.clone();
    if span == 0 {
        return Ok(to);
    }
    if span > T::field_count() {
        return Err(MessageError::InvalidFormat(format!(
            "delta span {span} exceeds {} fields",
            T::field_count()
        )));
    }

    let mask = r.read_bytes(span.div_ceil(8))?.to_vec();
    for i in 0..span {
        if mask[i / 8] & (1 << (i % 8)) != 0 {
            let value = read_field(r, T::FIELD_WIDTHS[i])?;
            to.set_field(i, value);
        }
    }
    Ok(to)
}

fn write_field(w: &mut MessageWriter, width: u8, value: u32) {
    match width {
        1 => w.write_u8(value as u8),
        2 => w.write_u16(value as u16),
        _ => w.write_u32(value),
    }
}

fn read_field(r: &mut MessageReader<'_>, width: u8) -> Result<u32, MessageError> {
    Ok(match width {
        1 => r.read_u8()? as u32,
        2 => r.read_u16()? as u32,
        _ => r.read_u32()?,
    })
}
