//! Tensor descriptors.
//!
//! A `TensorDesc` is a small `Copy` value describing a 4-D view
//! (width × height × depth × layers) over a linear buffer. Descriptors never
//! own storage: they name a buffer through a `BufferId` handle, and the
//! buffers themselves are owned by whoever allocated them (the graph
//! dispatcher or a CPU reference executor).
//!
//! All field "setters" return a new descriptor, so one activation can be fed
//! into several operator calls with different stride/padding without any
//! shared mutable state:
//!
//! ```
//! use tensorgraph_core::TensorDesc;
//!
//! let activation = TensorDesc::new(64, 64, 3, 1);
//! let strided = activation.with_stride(3).with_padding(2);
//!
//! assert_eq!(activation.stride, 1);
//! assert_eq!(strided.stride, 3);
//! assert_eq!(strided.padding, 2);
//! ```

use crate::format::Format;
use crate::{Error, Result};
use std::fmt;

/// Handle to a buffer owned by a dispatcher.
///
/// Handles are plain indices; they stay valid for the lifetime of the
/// dispatcher that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// Logical shape plus physical location of a 4-D tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorDesc {
    pub width: u32,
    pub height: u32,
    /// Channels per spatial layer.
    pub depth: u32,
    /// Independent tensor instances (image tiles, batch entries).
    pub layers: u32,

    pub format: Format,

    /// Backing buffer, `None` for a descriptor that only carries a shape.
    pub buffer: Option<BufferId>,
    /// Byte offset into `buffer`.
    pub offset: u64,

    /// Spatial step applied by windowed operators reading this tensor.
    pub stride: u32,
    /// Symmetric zero border applied by windowed operators reading this tensor.
    pub padding: u32,
}

impl Default for TensorDesc {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            depth: 0,
            layers: 0,
            format: Format::F32,
            buffer: None,
            offset: 0,
            stride: 1,
            padding: 0,
        }
    }
}

impl TensorDesc {
    /// Create an unbound f32 descriptor with the given shape.
    pub fn new(width: u32, height: u32, depth: u32, layers: u32) -> Self {
        Self {
            width,
            height,
            depth,
            layers,
            ..Default::default()
        }
    }

    /// Create an unshaped descriptor bound to `buffer`.
    ///
    /// Used as the destination of a dispatch: the dispatcher fills in the
    /// shape it computes for the operator's output.
    pub fn on(buffer: BufferId) -> Self {
        Self {
            buffer: Some(buffer),
            ..Default::default()
        }
    }

    /// Create an f32 descriptor of the given shape bound to `buffer` at offset 0.
    pub fn with_size(buffer: BufferId, width: u32, height: u32, depth: u32, layers: u32) -> Self {
        Self::new(width, height, depth, layers).with_buffer(buffer, 0)
    }

    pub fn with_buffer(self, buffer: BufferId, offset: u64) -> Self {
        Self {
            buffer: Some(buffer),
            offset,
            ..self
        }
    }

    pub fn with_offset(self, offset: u64) -> Self {
        Self { offset, ..self }
    }

    pub fn with_format(self, format: Format) -> Self {
        Self { format, ..self }
    }

    pub fn with_stride(self, stride: u32) -> Self {
        Self { stride, ..self }
    }

    pub fn with_padding(self, padding: u32) -> Self {
        Self { padding, ..self }
    }

    /// Replace the shape, keeping buffer, offset and format.
    pub fn with_shape(self, width: u32, height: u32, depth: u32, layers: u32) -> Self {
        Self {
            width,
            height,
            depth,
            layers,
            ..self
        }
    }

    /// Reinterpret the same elements under a new shape.
    ///
    /// Fails if the element count changes.
    pub fn reshaped(self, width: u32, height: u32, depth: u32, layers: u32) -> Result<Self> {
        let reshaped = self.with_shape(width, height, depth, layers);
        if reshaped.elements() != self.elements() {
            return Err(Error::Shape(format!(
                "cannot reshape {self} ({} elements) to {reshaped} ({} elements)",
                self.elements(),
                reshaped.elements()
            )));
        }
        Ok(reshaped)
    }

    /// View the tensor as one column vector per layer: `1 × (w·h·d) × 1 × layers`.
    ///
    /// Fails if the column length does not fit in a `u32`.
    pub fn flattened(self) -> Result<Self> {
        let column = self
            .width
            .checked_mul(self.height)
            .and_then(|n| n.checked_mul(self.depth))
            .ok_or_else(|| Error::Shape(format!("cannot flatten {self}: column too long")))?;
        Ok(self.with_shape(1, column, 1, self.layers))
    }

    /// Drop operator parameters (stride/padding) and the shape, keeping the binding.
    pub fn unshaped(self) -> Self {
        Self {
            buffer: self.buffer,
            offset: self.offset,
            ..Default::default()
        }
    }

    /// `[width, height, depth, layers]`.
    pub fn dims(&self) -> [u32; 4] {
        [self.width, self.height, self.depth, self.layers]
    }

    /// Whether the shape has been filled in.
    pub fn is_shaped(&self) -> bool {
        self.width != 0 && self.height != 0 && self.depth != 0 && self.layers != 0
    }

    /// Total number of elements.
    pub fn elements(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.depth as u64 * self.layers as u64
    }

    /// Total number of bytes the view covers.
    pub fn bytes(&self) -> u64 {
        self.elements() * self.format.size()
    }

    /// One past the last byte the view covers.
    pub fn end(&self) -> u64 {
        self.offset + self.bytes()
    }

    /// Offset expressed in elements of this descriptor's format.
    pub fn element_offset(&self) -> u64 {
        self.offset / self.format.size()
    }

    /// Index of element `(x, y, c, l)` relative to the view's first element.
    pub fn index(&self, x: u32, y: u32, c: u32, l: u32) -> usize {
        (((l as usize * self.depth as usize + c as usize) * self.height as usize + y as usize)
            * self.width as usize)
            + x as usize
    }

    /// Check the buffer-extent invariant against a buffer of `capacity` bytes.
    pub fn check_fits(&self, capacity: u64) -> Result<()> {
        if self.offset % self.format.size() != 0 {
            return Err(Error::configuration(format!(
                "{self} offset {} is not aligned to its {} elements",
                self.offset, self.format
            )));
        }
        if self.end() > capacity {
            return Err(Error::configuration(format!(
                "{self} needs {} bytes at offset {} but its buffer holds {capacity}",
                self.bytes(),
                self.offset
            )));
        }
        Ok(())
    }
}

impl fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}x{}x{}x{}]",
            self.width, self.height, self.depth, self.layers
        )?;
        if self.format != Format::F32 {
            write!(f, " {}", self.format)?;
        }
        if let Some(buffer) = self.buffer {
            write!(f, " @{buffer}+{}", self.offset)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setters_return_new_values() {
        let base = TensorDesc::with_size(BufferId(0), 8, 8, 3, 2);
        let conv_input = base.with_stride(2).with_padding(1);

        // Base descriptor is untouched
        assert_eq!(base.stride, 1);
        assert_eq!(base.padding, 0);

        assert_eq!(conv_input.stride, 2);
        assert_eq!(conv_input.padding, 1);
        assert_eq!(conv_input.dims(), base.dims());
        assert_eq!(conv_input.buffer, base.buffer);

        // Padding alone keeps the default stride
        let padded = base.with_padding(1);
        assert_eq!(padded.stride, 1);
    }

    #[test]
    fn test_unshaped_destination() {
        let dst = TensorDesc::on(BufferId(3));
        assert!(!dst.is_shaped());
        assert_eq!(dst.buffer, Some(BufferId(3)));
        assert_eq!(dst.elements(), 0);
    }

    #[test]
    fn test_sizes_and_offsets() {
        let t = TensorDesc::new(4, 3, 2, 5).with_buffer(BufferId(1), 64);
        assert_eq!(t.elements(), 120);
        assert_eq!(t.bytes(), 480);
        assert_eq!(t.end(), 544);
        assert_eq!(t.element_offset(), 16);

        let half = t.with_format(Format::F16);
        assert_eq!(half.bytes(), 240);
        assert_eq!(half.element_offset(), 32);
    }

    #[test]
    fn test_index_is_channel_major() {
        let t = TensorDesc::new(4, 3, 2, 2);
        assert_eq!(t.index(0, 0, 0, 0), 0);
        assert_eq!(t.index(1, 0, 0, 0), 1);
        assert_eq!(t.index(0, 1, 0, 0), 4);
        assert_eq!(t.index(0, 0, 1, 0), 12);
        assert_eq!(t.index(0, 0, 0, 1), 24);
        assert_eq!(t.index(3, 2, 1, 1), 47);
    }

    #[test]
    fn test_reshape_and_flatten() {
        let t = TensorDesc::with_size(BufferId(0), 2, 2, 96, 7);
        let flat = t.flattened().unwrap();
        assert_eq!(flat.dims(), [1, 384, 1, 7]);
        assert_eq!(flat.elements(), t.elements());

        let huge = TensorDesc::with_size(BufferId(0), 65536, 65536, 2, 1);
        assert!(huge.flattened().is_err());

        assert!(t.reshaped(4, 96, 1, 7).is_ok());
        assert!(t.reshaped(4, 96, 1, 6).is_err());
    }

    #[test]
    fn test_check_fits() {
        let t = TensorDesc::new(4, 4, 1, 1).with_buffer(BufferId(0), 16);
        assert!(t.check_fits(80).is_ok());
        assert!(t.check_fits(79).is_err());

        let misaligned = t.with_offset(6);
        assert!(misaligned.check_fits(1024).is_err());
    }

    #[test]
    fn test_display() {
        let t = TensorDesc::with_size(BufferId(2), 28, 28, 1, 4).with_offset(8);
        assert_eq!(t.to_string(), "[28x28x1x4] @buffer#2+8");
        assert_eq!(TensorDesc::new(3, 3, 1, 1).to_string(), "[3x3x1x1]");
    }
}
