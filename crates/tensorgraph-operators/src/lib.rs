//! Operator library for TensorGraph.
//!
//! Every operator is one compute kernel dispatched over the output tensor.
//! This crate owns everything about an operator that does not need a
//! device:
//!
//! - **Shape rules** (`shape`): exact integer output sizes for Conv, DeConv
//!   and MaxPool, and operand compatibility for the per-channel and matrix
//!   operators
//! - **Planning** (`plan`): validation of operands against buffer capacities
//!   and the engine configuration, producing the uniform block, buffer
//!   bindings and group counts for one dispatch
//! - **Kernels** (`kernel`, `compile`): WGSL sources preprocessed with
//!   naga_oil and validated with naga
//! - **Reference executor** (`reference`): a host implementation of every
//!   kernel over the same uniform block, used to check device results
//!
//! # Operators
//!
//! | Operation | Operands | Output |
//! |---|---|---|
//! | Conv | input, weight, bias? | `floor((n + 2p - k)/s) + 1` per axis, weight.layers channels |
//! | DeConv | input, weight, bias? | `(n - 1)s - 2p + k + output_padding`, weight.depth channels |
//! | MaxPool | input | `floor(n / s)` per axis |
//! | BatchNorm | input, mean, variance | input shape |
//! | BatchMad | input, multiplier, addend | input shape |
//! | MatMad | A, B, bias? | `M × N` per batch |

pub mod compile;
pub mod config;
pub mod kernel;
pub mod operation;
pub mod params;
pub mod plan;
pub mod reference;
pub mod shape;

// Re-export operator types
pub use compile::{CompiledKernel, compile_kernel};
pub use config::EngineConfig;
pub use kernel::{BindingKind, ImageFormat, Kernel};
pub use operation::Operation;
pub use params::KernelParams;
pub use plan::{BufferTable, ImageExtent, KernelCall};
pub use reference::CpuGraph;

/// Result type for operator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for operator operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Shader compilation failed for '{label}': {message}")]
    Shader { label: String, message: String },

    #[error(transparent)]
    Core(#[from] tensorgraph_core::Error),
}
