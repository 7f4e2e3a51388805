//! Built-in networks.
//!
//! Each network is its trained architecture written out as a stage list.
//! Weight operands index the model file's descriptors in file order.

use crate::stage::Stage;
use tensorgraph_core::Activation;

/// What a network produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkOutput {
    /// An image of the input's size, written back through the output tensor.
    Image,
    /// One score vector per tile, left in scratch.
    Logits,
}

/// A fixed architecture.
#[derive(Debug, Clone, PartialEq)]
pub struct Network {
    pub name: &'static str,
    /// Square tile edge the network was trained on.
    pub tile: u32,
    /// Input (and image output) channels.
    pub channels: u32,
    pub output: NetworkOutput,
    pub stages: Vec<Stage>,
}

/// Convolutional auto-encoder over 64×64 RGB tiles.
///
/// Four strided SiLU convolutions with per-channel affine steps, a binary16
/// round trip of the bottleneck, and four transposed convolutions back up
/// to the tile, the last one fused with a sigmoid and written straight into
/// the image tensor. The model's running statistics (tensors 3-4, 8-9,
/// 13-14) are already folded into the affine steps.
pub fn denoiser() -> Network {
    let stages = vec![
        Stage::conv(0).window(3, 2).activation(Activation::Silu).named("encoder.0"),
        Stage::batch_mad(1, 2).named("encoder.1"),
        Stage::conv(5).window(2, 2).activation(Activation::Silu).named("encoder.3"),
        Stage::batch_mad(6, 7).named("encoder.4"),
        Stage::conv(10).window(2, 1).activation(Activation::Silu).named("encoder.6"),
        Stage::batch_mad(11, 12).named("encoder.7"),
        Stage::conv(15).window(1, 1).activation(Activation::Silu).named("encoder.9"),
        Stage::quantize().named("bottleneck"),
        Stage::deconv(16).window(1, 1).activation(Activation::Silu).named("decoder.0"),
        Stage::deconv(17).window(2, 1).activation(Activation::Silu).named("decoder.2"),
        Stage::deconv(18).window(2, 1).activation(Activation::Silu).named("decoder.4"),
        Stage::deconv(19)
            .window(3, 1)
            .activation(Activation::Sigmoid)
            .into_output(1)
            .named("decoder.6"),
    ];
    Network {
        name: "denoiser",
        tile: 64,
        channels: 3,
        output: NetworkOutput::Image,
        stages,
    }
}

/// Digit classifier over 28×28 grayscale tiles.
///
/// Two blocks of ReLU convolution, 2×2 max pooling and split batch
/// normalization, then a dense head producing ten scores per tile.
pub fn classifier() -> Network {
    let stages = vec![
        Stage::conv(0).window(2, 1).activation(Activation::Relu).named("conv1"),
        Stage::max_pool(2).named("pool1"),
        Stage::batch_norm(3, 4).named("norm1"),
        Stage::batch_mad(1, 2).named("affine1"),
        Stage::conv(5).window(2, 1).activation(Activation::Relu).named("conv2"),
        Stage::max_pool(2).named("pool2"),
        Stage::batch_norm(8, 9).named("norm2"),
        Stage::batch_mad(6, 7).named("affine2"),
        Stage::mat_mad(10, 11).named("dense"),
    ];
    Network {
        name: "classifier",
        tile: 28,
        channels: 1,
        output: NetworkOutput::Logits,
        stages,
    }
}
