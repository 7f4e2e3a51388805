//! Core value types for the TensorGraph engine.
//!
//! This crate provides the foundational types every other TensorGraph crate
//! depends on:
//! - Tensor descriptors (`TensorDesc`) describing a 4-D view over a buffer
//! - Element formats (`Format`)
//! - Buffer handles (`BufferId`) used by descriptors to borrow storage
//! - Per-dispatch flags (`DispatchFlags`, `Activation`)

pub mod flags;
pub mod format;
pub mod tensor;

// Re-export commonly used types
pub use flags::{Activation, DispatchFlags};
pub use format::Format;
pub use tensor::{BufferId, TensorDesc};

/// Result type using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for tensor descriptor and dispatch validation.
///
/// Every variant describes an authoring bug in a fixed stage sequence; none
/// of them are recoverable at runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Unsupported format: {0}")]
    Format(String),
}

impl Error {
    /// Shorthand for building a configuration error from anything printable.
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }
}
