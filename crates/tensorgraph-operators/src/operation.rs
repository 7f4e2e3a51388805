//! The operator vocabulary accepted by the dispatcher.

use std::fmt;
use std::ops::RangeInclusive;

/// A tensor operator.
///
/// Operand order is fixed per operator; the first operand is always the
/// activation whose stride and padding drive windowed operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// 2-D convolution: input, weight `[kw × kh × in × out]`, optional bias.
    Conv,
    /// Transposed 2-D convolution: input, weight `[kw × kh × out × in]`, optional bias.
    DeConv,
    /// Max pooling with a `stride × stride` window.
    MaxPool,
    /// Per-channel normalization: input, running mean, running variance.
    BatchNorm,
    /// Per-channel multiply-add: input, multiplier, addend.
    BatchMad,
    /// Batched matrix multiply-add: A, B, optional bias.
    MatMad,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::Conv,
        Operation::DeConv,
        Operation::MaxPool,
        Operation::BatchNorm,
        Operation::BatchMad,
        Operation::MatMad,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Operation::Conv => "conv",
            Operation::DeConv => "deconv",
            Operation::MaxPool => "maxpool",
            Operation::BatchNorm => "batch_norm",
            Operation::BatchMad => "batch_mad",
            Operation::MatMad => "mat_mad",
        }
    }

    /// Accepted number of source operands.
    pub fn operands(self) -> RangeInclusive<usize> {
        match self {
            Operation::Conv | Operation::DeConv | Operation::MatMad => 2..=3,
            Operation::MaxPool => 1..=1,
            Operation::BatchNorm | Operation::BatchMad => 3..=3,
        }
    }

    /// Whether the operator reads its input through a stride/padding window.
    pub fn is_windowed(self) -> bool {
        matches!(
            self,
            Operation::Conv | Operation::DeConv | Operation::MaxPool
        )
    }

    /// Whether a fused activation may be requested.
    pub fn accepts_activation(self) -> bool {
        !matches!(self, Operation::MaxPool)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
