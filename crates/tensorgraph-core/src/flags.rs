//! Per-dispatch flags and fused activations.

use crate::{Error, Result};
use bitflags::bitflags;

bitflags! {
    /// Flags accepted by a single operator dispatch.
    ///
    /// At most one activation flag may be set per call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DispatchFlags: u32 {
        /// Fuse `max(x, 0)`.
        const RELU = 1 << 0;
        /// Fuse `x * sigmoid(x)`.
        const SILU = 1 << 1;
        /// Fuse `1 / (1 + e^-x)`.
        const SIGMOID = 1 << 2;
        /// MatMad: read both matrix operands transposed.
        const TRANSPOSE = 1 << 3;

        const ACTIVATIONS = Self::RELU.bits() | Self::SILU.bits() | Self::SIGMOID.bits();
    }
}

impl DispatchFlags {
    /// Resolve the fused activation, rejecting conflicting requests.
    pub fn activation(self) -> Result<Activation> {
        let requested = self & DispatchFlags::ACTIVATIONS;
        match requested {
            f if f.is_empty() => Ok(Activation::None),
            f if f == DispatchFlags::RELU => Ok(Activation::Relu),
            f if f == DispatchFlags::SILU => Ok(Activation::Silu),
            f if f == DispatchFlags::SIGMOID => Ok(Activation::Sigmoid),
            f => Err(Error::configuration(format!(
                "activation flags are mutually exclusive, got {f:?}"
            ))),
        }
    }
}

impl From<Activation> for DispatchFlags {
    fn from(activation: Activation) -> Self {
        match activation {
            Activation::None => DispatchFlags::empty(),
            Activation::Relu => DispatchFlags::RELU,
            Activation::Silu => DispatchFlags::SILU,
            Activation::Sigmoid => DispatchFlags::SIGMOID,
        }
    }
}

/// Nonlinearity applied in-kernel right after accumulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Activation {
    #[default]
    None,
    Relu,
    Silu,
    Sigmoid,
}

impl Activation {
    /// Activation code understood by the kernels' uniform block.
    pub fn code(self) -> u32 {
        match self {
            Activation::None => 0,
            Activation::Relu => 1,
            Activation::Silu => 2,
            Activation::Sigmoid => 3,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Activation::None),
            1 => Some(Activation::Relu),
            2 => Some(Activation::Silu),
            3 => Some(Activation::Sigmoid),
            _ => None,
        }
    }

    /// Apply the activation on the host, matching the kernels bit for bit
    /// as far as f32 `exp` allows.
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Activation::None => x,
            Activation::Relu => x.max(0.0),
            Activation::Silu => x / (1.0 + (-x).exp()),
            Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        }
    }
}
