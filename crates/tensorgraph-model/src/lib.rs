//! Model file loader for TensorGraph.
//!
//! A model file is a list of tensor descriptors followed by a single flat
//! weight blob. Every descriptor is a view (offset + shape) into that blob;
//! nothing is copied per tensor.
//!
//! # Format
//!
//! Little-endian, read sequentially:
//!
//! ```text
//! repeat:
//!   u8   rank_marker        0..=4, or 0xFF = end of descriptor list
//!   u16  dims[rank_marker]  layers, depth, height, width (most significant first)
//!   u32  element_offset     byte offset = element_offset * 4
//!   cstr name               NUL-terminated, diagnostics only
//! then:
//!   u32  weight_count
//!   f32  weights[weight_count]
//! ```
//!
//! # Example
//!
//! ```no_run
//! use tensorgraph_model::load_model;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let model = load_model("model.bin")?;
//! for (index, entry) in model.entries.iter().enumerate() {
//!     println!("{index}: {} {}", entry.name, entry.desc);
//! }
//! # Ok(())
//! # }
//! ```

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use thiserror::Error;

pub mod model;
pub mod reader;
pub mod writer;

pub use model::{Model, ModelEntry, Weights};
pub use reader::read_model;
pub use writer::{ModelWriter, encode_model};

/// Rank marker that terminates the descriptor list.
pub const END_OF_DESCRIPTORS: u8 = 0xff;

/// Highest supported tensor rank.
pub const MAX_RANK: u8 = 4;

/// Errors that can occur while loading a model.
///
/// Every variant is fatal: there is no partial load.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Failed to read model file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model truncated while reading {what} at byte {position}")]
    Truncated { what: &'static str, position: u64 },

    #[error("Invalid rank marker {rank} at byte {position}")]
    InvalidRank { rank: u8, position: u64 },

    #[error("Weight blob declares {declared} values but only {read} could be read")]
    WeightCountMismatch { declared: u64, read: u64 },

    #[error("Tensor {index} ('{name}') ends at byte {end} past the {size}-byte weight blob")]
    TensorOutOfBounds {
        index: usize,
        name: String,
        end: u64,
        size: u64,
    },

    #[error("Invalid model: {0}")]
    InvalidModel(String),
}

/// Result type for model loading.
pub type Result<T> = std::result::Result<T, LoadError>;

/// Load a model from a file.
pub fn load_model<P: AsRef<Path>>(path: P) -> Result<Model> {
    let file = File::open(path.as_ref())?;
    read_model(BufReader::new(file))
}

/// Parse a model from an in-memory byte slice.
pub fn parse_model(bytes: &[u8]) -> Result<Model> {
    read_model(bytes)
}
