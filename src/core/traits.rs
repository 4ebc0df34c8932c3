//! Core traits.
//!
//! [`DeltaState`] is the interface every delta-compressed record implements:
//! entity states, the per-participant player state and user input commands.

/// A record made of numbered fields that can be delta-compressed.
///
/// Each field is carried as a 32-bit value (floats as their IEEE bit
/// pattern) and written on the wire with the width given in
/// [`FIELD_WIDTHS`](Self::FIELD_WIDTHS). Narrow fields must hold unsigned
/// values that fit their width.
///
/// # Requirements
///
/// - `set_field(i, x.field(i))` MUST leave `x` unchanged
/// - A field table of more than 255 entries is not representable
///
/// # Example
///
/// ```
/// use tickwire::core::DeltaState;
///
/// #[derive(Clone, Default, PartialEq, Debug)]
/// struct Door { open: u32, angle: f32 }
///
/// impl DeltaState for Door {
///     const FIELD_WIDTHS: &'static [u8] = &[1, 4];
///
///     fn field(&self, index: usize) -> u32 {
///         match index {
///             0 => self.open,
///             _ => self.angle.to_bits(),
///         }
///     }
///
///     fn set_field(&mut self, index: usize, value: u32) {
///         match index {
///             0 => self.open = value,
///             _ => self.angle = f32::from_bits(value),
///         }
///     }
/// }
///
/// let a = Door::default();
/// let b = Door { open: 1, angle: 0.0 };
/// assert_eq!(b.last_changed_field(&a), Some(0));
/// ```
pub trait DeltaState: Clone + Default + PartialEq {
    /// Wire width in bytes (1, 2 or 4) of each field, in field order.
    const FIELD_WIDTHS: &'static [u8];

    /// Read field `index` as raw bits.
    fn field(&self, index: usize) -> u32;

    /// Overwrite field `index` with raw bits.
    fn set_field(&mut self, index: usize, value: u32);

    /// Number of fields.
    fn field_count() -> usize {
        Self::FIELD_WIDTHS.len()
    }

    /// Index of the last field that differs from `from`, if any.
    fn last_changed_field(&self, from: &Self) -> Option<usize> {
        (0..Self::field_count())
            .rev()
            .find(|&i| self.field(i) != from.field(i))
    }
}
