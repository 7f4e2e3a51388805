//! In-memory model representation.

use crate::{LoadError, Result};
use half::f16;
use tensorgraph_core::{BufferId, Format, TensorDesc};

/// One tensor descriptor from the model header.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelEntry {
    /// Informational name (never bound into the descriptor).
    pub name: String,

    /// Number of dimensions stored in the file.
    pub rank: u8,

    /// Shape and byte offset into the weight blob. Unbound until
    /// [`Model::bind`] attaches the weights buffer.
    pub desc: TensorDesc,
}

/// The shared weight blob.
#[derive(Debug, Clone, PartialEq)]
pub enum Weights {
    F32(Vec<f32>),
    F16(Vec<f16>),
}

impl Weights {
    /// Number of stored values.
    pub fn len(&self) -> usize {
        match self {
            Weights::F32(values) => values.len(),
            Weights::F16(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn format(&self) -> Format {
        match self {
            Weights::F32(_) => Format::F32,
            Weights::F16(_) => Format::F16,
        }
    }

    /// Size of the blob in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.len() as u64 * self.format().size()
    }

    /// Raw little-endian bytes, zero-padded to a multiple of 4 for upload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = match self {
            Weights::F32(values) => bytemuck::cast_slice::<f32, u8>(values).to_vec(),
            Weights::F16(values) => bytemuck::cast_slice::<f16, u8>(values).to_vec(),
        };
        bytes.resize(bytes.len().next_multiple_of(4), 0);
        bytes
    }

    /// All values widened to f32.
    pub fn to_f32(&self) -> Vec<f32> {
        match self {
            Weights::F32(values) => values.clone(),
            Weights::F16(values) => values.iter().map(|v| v.to_f32()).collect(),
        }
    }
}

/// A loaded model: descriptors plus the weight blob they view into.
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    pub entries: Vec<ModelEntry>,
    pub weights: Weights,
}

impl Model {
    /// Number of tensor descriptors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find a descriptor by its informational name.
    pub fn find(&self, name: &str) -> Option<(usize, &ModelEntry)> {
        self.entries
            .iter()
            .enumerate()
            .find(|(_, entry)| entry.name == name)
    }

    /// Bind every descriptor to the buffer holding the weight blob.
    pub fn bind(&self, weights: BufferId) -> Vec<TensorDesc> {
        self.entries
            .iter()
            .map(|entry| {
                entry
                    .desc
                    .with_buffer(weights, entry.desc.offset)
                    .with_format(self.weights.format())
            })
            .collect()
    }

    /// Check that every descriptor lies inside the weight blob.
    pub fn validate(&self) -> Result<()> {
        let size = self.weights.size_bytes();
        for (index, entry) in self.entries.iter().enumerate() {
            let end = entry.desc.end();
            if end > size {
                return Err(LoadError::TensorOutOfBounds {
                    index,
                    name: entry.name.clone(),
                    end,
                    size,
                });
            }
        }
        Ok(())
    }

    /// Convert the blob to packed binary16, rewriting offsets and formats.
    pub fn to_f16(&self) -> Model {
        let weights = match &self.weights {
            Weights::F32(values) => values.iter().map(|&v| f16::from_f32(v)).collect(),
            Weights::F16(values) => values.clone(),
        };
        let entries = self
            .entries
            .iter()
            .map(|entry| {
                let element_offset = entry.desc.element_offset();
                ModelEntry {
                    desc: entry
                        .desc
                        .with_format(Format::F16)
                        .with_offset(element_offset * Format::F16.size()),
                    ..entry.clone()
                }
            })
            .collect();

        Model {
            entries,
            weights: Weights::F16(weights),
        }
    }

    /// Values of one descriptor widened to f32, in element order.
    pub fn values(&self, index: usize) -> Option<Vec<f32>> {
        let entry = self.entries.get(index)?;
        let start = entry.desc.element_offset() as usize;
        let end = start + entry.desc.elements() as usize;
        match &self.weights {
            Weights::F32(values) => values.get(start..end).map(|s| s.to_vec()),
            Weights::F16(values) => values
                .get(start..end)
                .map(|s| s.iter().map(|v| v.to_f32()).collect()),
        }
    }
}
