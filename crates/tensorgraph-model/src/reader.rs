//! Sequential model file reader.

use crate::model::{Model, ModelEntry, Weights};
use crate::{END_OF_DESCRIPTORS, LoadError, MAX_RANK, Result};
use std::io::{ErrorKind, Read};
use tensorgraph_core::TensorDesc;
use tracing::{debug, info, warn};

/// Read a complete model from `reader`.
///
/// The descriptor list, the weight count and the weight blob must all be
/// present; any shortfall is a [`LoadError`]. Descriptors are validated
/// against the blob before returning.
pub fn read_model<R: Read>(reader: R) -> Result<Model> {
    let mut reader = ModelReader::new(reader);

    let mut entries = Vec::new();
    loop {
        let position = reader.position;
        let rank = reader.read_u8("rank marker")?;
        if rank == END_OF_DESCRIPTORS {
            break;
        }
        if rank > MAX_RANK {
            return Err(LoadError::InvalidRank { rank, position });
        }

        // Dimensions are stored most significant first; missing ones stay 1.
        let mut dims = [1u32; 4];
        for (slot, dim) in dims.iter_mut().enumerate() {
            if rank as usize > 3 - slot {
                *dim = reader.read_u16("dimension")? as u32;
            }
        }
        let [layers, depth, height, width] = dims;

        let element_offset = reader.read_u32("element offset")?;
        let name = reader.read_cstr()?;

        let desc = TensorDesc::new(width, height, depth, layers).with_offset(element_offset as u64 * 4);
        info!("{}: {} {}", entries.len(), name, desc);

        entries.push(ModelEntry { name, rank, desc });
    }

    let declared = reader.read_u32("weight count")? as u64;
    let weights = reader.read_weights(declared)?;
    if reader.has_trailing_data()? {
        warn!("ignoring trailing data after the weight blob");
    }

    let model = Model {
        entries,
        weights: Weights::F32(weights),
    };
    model.validate()?;

    debug!(
        tensors = model.len(),
        weights = model.weights.len(),
        "model loaded"
    );

    Ok(model)
}

/// Little-endian reader tracking its byte position for diagnostics.
struct ModelReader<R> {
    inner: R,
    position: u64,
}

impl<R: Read> ModelReader<R> {
    fn new(inner: R) -> Self {
        Self { inner, position: 0 }
    }

    fn read_exact<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        match self.inner.read_exact(&mut buf) {
            Ok(()) => {
                self.position += N as u64;
                Ok(buf)
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(LoadError::Truncated {
                what,
                position: self.position,
            }),
            Err(e) => Err(LoadError::Io(e)),
        }
    }

    fn read_u8(&mut self, what: &'static str) -> Result<u8> {
        Ok(self.read_exact::<1>(what)?[0])
    }

    fn read_u16(&mut self, what: &'static str) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_exact(what)?))
    }

    fn read_u32(&mut self, what: &'static str) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_exact(what)?))
    }

    fn read_cstr(&mut self) -> Result<String> {
        let mut bytes = Vec::new();
        loop {
            match self.read_u8("tensor name")? {
                0 => break,
                byte => bytes.push(byte),
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn read_weights(&mut self, declared: u64) -> Result<Vec<f32>> {
        let expected = declared * 4;
        let mut bytes = Vec::new();
        (&mut self.inner).take(expected).read_to_end(&mut bytes)?;
        self.position += bytes.len() as u64;

        if bytes.len() as u64 != expected {
            return Err(LoadError::WeightCountMismatch {
                declared,
                read: bytes.len() as u64 / 4,
            });
        }

        Ok(bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }

    fn has_trailing_data(&mut self) -> Result<bool> {
        let mut probe = [0u8; 1];
        loop {
            match self.inner.read(&mut probe) {
                Ok(n) => return Ok(n > 0),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(LoadError::Io(e)),
            }
        }
    }
}
