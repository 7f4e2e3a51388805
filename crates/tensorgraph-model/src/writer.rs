//! Model file writer.
//!
//! Produces the same layout [`read_model`](crate::read_model) consumes. Used
//! by tooling that exports trained weights and by tests.

use crate::model::ModelEntry;
use crate::{END_OF_DESCRIPTORS, LoadError, MAX_RANK, Result};
use std::io::Write;

/// Encode descriptors and a weight blob exactly as given.
///
/// Each entry is written with its own `rank`; only the most significant
/// `rank` dimensions are stored, so dimensions beyond the rank must be 1.
pub fn encode_model(entries: &[ModelEntry], weights: &[f32]) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    write_model(&mut bytes, entries, weights)?;
    Ok(bytes)
}

/// Stream descriptors and a weight blob into `writer`.
pub fn write_model<W: Write>(writer: &mut W, entries: &[ModelEntry], weights: &[f32]) -> Result<()> {
    for entry in entries {
        write_entry(writer, entry)?;
    }
    writer.write_all(&[END_OF_DESCRIPTORS])?;

    let count = u32::try_from(weights.len())
        .map_err(|_| LoadError::InvalidModel(format!("{} weights exceed u32", weights.len())))?;
    writer.write_all(&count.to_le_bytes())?;
    for value in weights {
        writer.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

fn write_entry<W: Write>(writer: &mut W, entry: &ModelEntry) -> Result<()> {
    if entry.rank > MAX_RANK {
        return Err(LoadError::InvalidModel(format!(
            "tensor '{}' has rank {}",
            entry.name, entry.rank
        )));
    }

    let desc = &entry.desc;
    let dims = [desc.layers, desc.depth, desc.height, desc.width];
    let stored = 4 - entry.rank as usize;
    if dims[..stored].iter().any(|&d| d != 1) {
        return Err(LoadError::InvalidModel(format!(
            "tensor '{}' {} does not fit rank {}",
            entry.name, desc, entry.rank
        )));
    }

    writer.write_all(&[entry.rank])?;
    for &dim in &dims[stored..] {
        let dim = u16::try_from(dim).map_err(|_| {
            LoadError::InvalidModel(format!("tensor '{}' dimension {dim} exceeds u16", entry.name))
        })?;
        writer.write_all(&dim.to_le_bytes())?;
    }

    if desc.offset % 4 != 0 {
        return Err(LoadError::InvalidModel(format!(
            "tensor '{}' offset {} is not a multiple of 4",
            entry.name, desc.offset
        )));
    }
    let element_offset = u32::try_from(desc.offset / 4).map_err(|_| {
        LoadError::InvalidModel(format!("tensor '{}' offset exceeds u32", entry.name))
    })?;
    writer.write_all(&element_offset.to_le_bytes())?;

    writer.write_all(entry.name.as_bytes())?;
    writer.write_all(&[0])?;
    Ok(())
}

/// Incremental builder that lays tensors out in one blob.
///
/// Each tensor starts at a multiple of `alignment` elements and is
/// zero-padded up to the next one, matching the exporter used for the
/// bundled networks.
///
/// ```
/// use tensorgraph_model::{ModelWriter, parse_model};
///
/// let mut writer = ModelWriter::new();
/// writer.push("conv.weight", &[4, 1, 3, 3], &[0.25; 36]).unwrap();
/// writer.push("norm.bias", &[4], &[0.0; 4]).unwrap();
///
/// let model = parse_model(&writer.finish().unwrap()).unwrap();
/// assert_eq!(model.entries[1].desc.offset, 64 * 4);
/// ```
#[derive(Debug, Clone)]
pub struct ModelWriter {
    alignment: usize,
    entries: Vec<ModelEntry>,
    weights: Vec<f32>,
}

impl Default for ModelWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelWriter {
    pub fn new() -> Self {
        Self::with_alignment(64)
    }

    /// Use a custom tensor alignment (in elements, at least 1).
    pub fn with_alignment(alignment: usize) -> Self {
        Self {
            alignment: alignment.max(1),
            entries: Vec::new(),
            weights: Vec::new(),
        }
    }

    /// Append a tensor given its shape in file order (most significant first).
    ///
    /// Returns the tensor's index.
    pub fn push(&mut self, name: &str, shape: &[u16], data: &[f32]) -> Result<usize> {
        if shape.len() > MAX_RANK as usize {
            return Err(LoadError::InvalidModel(format!(
                "tensor '{name}' has rank {}",
                shape.len()
            )));
        }
        let elements: usize = shape.iter().map(|&d| d as usize).product();
        if elements != data.len() {
            return Err(LoadError::InvalidModel(format!(
                "tensor '{name}' shape {shape:?} holds {elements} values, got {}",
                data.len()
            )));
        }

        let mut dims = [1u32; 4];
        for (slot, &dim) in dims[4 - shape.len()..].iter_mut().zip(shape) {
            *slot = dim as u32;
        }
        let [layers, depth, height, width] = dims;

        let offset = self.weights.len();
        self.weights.extend_from_slice(data);
        self.weights
            .resize(offset + data.len().next_multiple_of(self.alignment), 0.0);

        self.entries.push(ModelEntry {
            name: name.to_string(),
            rank: shape.len() as u8,
            desc: tensorgraph_core::TensorDesc::new(width, height, depth, layers)
                .with_offset(offset as u64 * 4),
        });
        Ok(self.entries.len() - 1)
    }

    /// Entries appended so far.
    pub fn entries(&self) -> &[ModelEntry] {
        &self.entries
    }

    /// Encode the model.
    pub fn finish(&self) -> Result<Vec<u8>> {
        encode_model(&self.entries, &self.weights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Weights, parse_model};
    use tensorgraph_core::TensorDesc;

    #[test]
    fn test_round_trip_exact_fields() {
        let entries = vec![
            ModelEntry {
                name: "encoder.0.weight".to_string(),
                rank: 4,
                desc: TensorDesc::new(5, 5, 3, 16).with_offset(0),
            },
            ModelEntry {
                name: "encoder.2.running_mean".to_string(),
                rank: 1,
                desc: TensorDesc::new(16, 1, 1, 1).with_offset(1200 * 4),
            },
            ModelEntry {
                name: "linear.weight".to_string(),
                rank: 2,
                desc: TensorDesc::new(12, 10, 1, 1).with_offset(1216 * 4),
            },
            ModelEntry {
                name: "bias3".to_string(),
                rank: 3,
                desc: TensorDesc::new(2, 2, 2, 1).with_offset(1336 * 4),
            },
        ];
        let weights: Vec<f32> = (0..1344).map(|i| (i as f32).sin() * 0.1).collect();

        let bytes = encode_model(&entries, &weights).unwrap();
        let model = parse_model(&bytes).unwrap();

        assert_eq!(model.entries, entries);
        assert_eq!(model.weights, Weights::F32(weights));
    }

    #[test]
    fn test_writer_alignment() {
        let mut writer = ModelWriter::with_alignment(8);
        writer.push("a", &[3], &[1.0, 2.0, 3.0]).unwrap();
        writer.push("b", &[2, 5], &[0.5; 10]).unwrap();
        writer.push("c", &[], &[7.0]).unwrap();

        let model = parse_model(&writer.finish().unwrap()).unwrap();
        assert_eq!(model.entries[0].desc.offset, 0);
        assert_eq!(model.entries[1].desc.offset, 8 * 4);
        assert_eq!(model.entries[1].desc.dims(), [5, 2, 1, 1]);
        assert_eq!(model.entries[2].desc.offset, 24 * 4);
        assert_eq!(model.weights.len(), 32);
        assert_eq!(model.values(0).unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(model.values(2).unwrap(), vec![7.0]);
    }

    #[test]
    fn test_writer_rejects_bad_input() {
        let mut writer = ModelWriter::new();
        assert!(writer.push("x", &[2, 2], &[1.0; 3]).is_err());
        assert!(writer.push("x", &[1, 1, 1, 1, 1], &[1.0]).is_err());
    }

    #[test]
    fn test_rank_must_cover_shape() {
        let entry = ModelEntry {
            name: "bad".to_string(),
            rank: 1,
            desc: TensorDesc::new(4, 2, 1, 1),
        };
        assert!(encode_model(&[entry], &[0.0; 8]).is_err());
    }
}
