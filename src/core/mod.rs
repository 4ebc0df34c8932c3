//! Core traits, constants and error types.
//!
//! Everything here is free of I/O and shared by every other layer.

mod constants;
mod error;
mod traits;

pub use constants::*;
pub use error::*;
pub use traits::*;
