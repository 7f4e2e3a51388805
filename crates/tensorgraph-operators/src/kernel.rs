//! Kernel catalogue: WGSL sources and binding layouts.

use crate::operation::Operation;
use std::fmt;

/// Prelude prepended to every kernel: the `Params` struct and shared helpers.
pub const COMMON_WGSL: &str = include_str!("../shaders/common.wgsl");

/// Operand bindings and load helpers of the tensor operators.
pub const OPERANDS_WGSL: &str = include_str!("../shaders/operands.wgsl");

/// A compute kernel.
///
/// Every [`Operation`] has a kernel of its own; the remaining kernels serve
/// the image conversion and quantization stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    Conv,
    DeConv,
    MaxPool,
    BatchNorm,
    BatchMad,
    MatMad,
    ImageToTensor,
    TensorToImage,
    Quantize,
}

/// Resource type of one binding slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Uniform,
    StorageRead,
    StorageReadWrite,
    /// Sampled `texture_2d<f32>` read with `textureLoad`.
    Texture,
    /// Write-only storage texture in the configured [`ImageFormat`].
    StorageTexture,
}

/// Pixel format of the images the conversion kernels read and write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageFormat {
    #[default]
    Rgba8Unorm,
    Rgba32Float,
}

impl ImageFormat {
    /// Bytes per pixel.
    pub fn pixel_size(self) -> u32 {
        match self {
            ImageFormat::Rgba8Unorm => 4,
            ImageFormat::Rgba32Float => 16,
        }
    }
}

const TENSOR_BINDINGS: &[BindingKind] = &[
    BindingKind::Uniform,
    BindingKind::StorageReadWrite,
    BindingKind::StorageRead,
    BindingKind::StorageRead,
    BindingKind::StorageRead,
];

impl Kernel {
    pub const ALL: [Kernel; 9] = [
        Kernel::Conv,
        Kernel::DeConv,
        Kernel::MaxPool,
        Kernel::BatchNorm,
        Kernel::BatchMad,
        Kernel::MatMad,
        Kernel::ImageToTensor,
        Kernel::TensorToImage,
        Kernel::Quantize,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Kernel::Conv => "conv",
            Kernel::DeConv => "deconv",
            Kernel::MaxPool => "maxpool",
            Kernel::BatchNorm => "batch_norm",
            Kernel::BatchMad => "batch_mad",
            Kernel::MatMad => "mat_mad",
            Kernel::ImageToTensor => "image_to_tensor",
            Kernel::TensorToImage => "tensor_to_image",
            Kernel::Quantize => "quantize",
        }
    }

    /// Kernel body, without the common prelude.
    pub fn source(self) -> &'static str {
        match self {
            Kernel::Conv => include_str!("../shaders/conv.wgsl"),
            Kernel::DeConv => include_str!("../shaders/deconv.wgsl"),
            Kernel::MaxPool => include_str!("../shaders/maxpool.wgsl"),
            Kernel::BatchNorm => include_str!("../shaders/batch_norm.wgsl"),
            Kernel::BatchMad => include_str!("../shaders/batch_mad.wgsl"),
            Kernel::MatMad => include_str!("../shaders/mat_mad.wgsl"),
            Kernel::ImageToTensor => include_str!("../shaders/image_to_tensor.wgsl"),
            Kernel::TensorToImage => include_str!("../shaders/tensor_to_image.wgsl"),
            Kernel::Quantize => include_str!("../shaders/quantize.wgsl"),
        }
    }

    /// Whether the kernel is one of the tensor operators sharing
    /// [`OPERANDS_WGSL`].
    pub fn is_operator(self) -> bool {
        self.operation().is_some()
    }

    pub fn operation(self) -> Option<Operation> {
        match self {
            Kernel::Conv => Some(Operation::Conv),
            Kernel::DeConv => Some(Operation::DeConv),
            Kernel::MaxPool => Some(Operation::MaxPool),
            Kernel::BatchNorm => Some(Operation::BatchNorm),
            Kernel::BatchMad => Some(Operation::BatchMad),
            Kernel::MatMad => Some(Operation::MatMad),
            Kernel::ImageToTensor | Kernel::TensorToImage | Kernel::Quantize => None,
        }
    }

    /// Complete WGSL source fed to the preprocessor.
    pub fn full_source(self) -> String {
        let mut source = String::from(COMMON_WGSL);
        if self.is_operator() {
            source.push('\n');
            source.push_str(OPERANDS_WGSL);
        }
        source.push('\n');
        source.push_str(self.source());
        source
    }

    /// Binding slots of group 0, in binding order.
    ///
    /// Tensor kernels share one layout: uniform, destination, then three
    /// read-only operands. Operators with fewer operands rebind the first
    /// source in the unused slots.
    pub fn bindings(self) -> &'static [BindingKind] {
        match self {
            Kernel::Quantize => &[BindingKind::Uniform, BindingKind::StorageReadWrite],
            Kernel::ImageToTensor => &[
                BindingKind::Uniform,
                BindingKind::StorageReadWrite,
                BindingKind::Texture,
            ],
            Kernel::TensorToImage => &[
                BindingKind::Uniform,
                BindingKind::StorageTexture,
                BindingKind::StorageRead,
            ],
            _ => TENSOR_BINDINGS,
        }
    }
}

impl From<Operation> for Kernel {
    fn from(operation: Operation) -> Self {
        match operation {
            Operation::Conv => Kernel::Conv,
            Operation::DeConv => Kernel::DeConv,
            Operation::MaxPool => Kernel::MaxPool,
            Operation::BatchNorm => Kernel::BatchNorm,
            Operation::BatchMad => Kernel::BatchMad,
            Operation::MatMad => Kernel::MatMad,
        }
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operations_map_to_operator_kernels() {
        for operation in Operation::ALL {
            let kernel = Kernel::from(operation);
            assert_eq!(kernel.operation(), Some(operation));
            assert_eq!(kernel.label(), operation.name());
            assert_eq!(kernel.bindings().len(), 5);
        }
        assert!(!Kernel::Quantize.is_operator());
        assert_eq!(Kernel::TensorToImage.bindings()[1], BindingKind::StorageTexture);
    }

    #[test]
    fn test_full_source_includes_prelude() {
        let conv = Kernel::Conv.full_source();
        assert!(conv.contains("struct Params"));
        assert!(conv.contains("fn load_aux0"));

        let quantize = Kernel::Quantize.full_source();
        assert!(quantize.contains("struct Params"));
        assert!(!quantize.contains("fn load_aux0"));
    }
}
