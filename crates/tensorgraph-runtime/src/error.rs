//! Error types for the runtime crate.

use thiserror::Error;

/// Runtime errors.
///
/// `Setup` and `Load` abort session construction, `Configuration` reports an
/// invalid stage before anything is dispatched, and `Device` ends the frame
/// loop.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// No usable adapter, device or kernel.
    #[error("GPU setup failed: {0}")]
    Setup(String),

    #[error(transparent)]
    Load(#[from] tensorgraph_model::LoadError),

    #[error(transparent)]
    Configuration(#[from] tensorgraph_core::Error),

    /// Buffer or texture exceeds the device limits.
    #[error("Allocation failed: {0}")]
    Allocation(String),

    /// Poll or readback failure during a frame.
    #[error("Device error: {0}")]
    Device(String),

    #[error("Buffer async error: {0}")]
    BufferAsync(#[from] wgpu::BufferAsyncError),
}

impl From<tensorgraph_operators::Error> for RuntimeError {
    fn from(error: tensorgraph_operators::Error) -> Self {
        match error {
            tensorgraph_operators::Error::Core(error) => RuntimeError::Configuration(error),
            error @ tensorgraph_operators::Error::Shader { .. } => {
                RuntimeError::Setup(error.to_string())
            }
        }
    }
}

/// Specialized Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
