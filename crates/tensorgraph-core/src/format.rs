//! Element formats.

use std::fmt;

/// Element encoding of a tensor.
///
/// F16 is a storage format only: values are packed two per 32-bit word and
/// widened to f32 before any arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    #[default]
    F32,
    F16,
}

impl Format {
    /// Size of one element in bytes.
    pub fn size(self) -> u64 {
        match self {
            Format::F32 => 4,
            Format::F16 => 2,
        }
    }

    /// Format code understood by the kernels' uniform block.
    pub fn code(self) -> u32 {
        match self {
            Format::F32 => 0,
            Format::F16 => 1,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::F32 => write!(f, "f32"),
            Format::F16 => write!(f, "f16"),
        }
    }
}
