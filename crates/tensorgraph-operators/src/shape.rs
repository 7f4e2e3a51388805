//! Output shape rules.
//!
//! All sizes are exact integer arithmetic; an input that does not produce at
//! least one output element is a configuration error rather than a clamp.

use crate::operation::Operation;
use tensorgraph_core::{DispatchFlags, Error, Result, TensorDesc};

/// Convolution output extent: `floor((input + 2·padding - kernel) / stride) + 1`.
pub fn conv_output(input: u32, kernel: u32, stride: u32, padding: u32) -> Result<u32> {
    if stride == 0 || kernel == 0 {
        return Err(Error::configuration("conv stride and kernel must be non-zero"));
    }
    let padded = input as u64 + 2 * padding as u64;
    if padded < kernel as u64 {
        return Err(Error::configuration(format!(
            "conv kernel {kernel} does not fit input {input} with padding {padding}"
        )));
    }
    narrow((padded - kernel as u64) / stride as u64 + 1)
}

/// Transposed convolution output extent:
/// `(input - 1)·stride - 2·padding + kernel + output_padding`.
///
/// `output_padding` must be smaller than `stride`; it selects between the
/// several input sizes that map to the same convolution output.
pub fn deconv_output(
    input: u32,
    kernel: u32,
    stride: u32,
    padding: u32,
    output_padding: u32,
) -> Result<u32> {
    if stride == 0 || kernel == 0 || input == 0 {
        return Err(Error::configuration(
            "deconv stride, kernel and input must be non-zero",
        ));
    }
    if output_padding >= stride {
        return Err(Error::configuration(format!(
            "deconv output padding {output_padding} must be smaller than stride {stride}"
        )));
    }
    let full = (input as u64 - 1) * stride as u64 + kernel as u64 + output_padding as u64;
    let border = 2 * padding as u64;
    if full <= border {
        return Err(Error::configuration(format!(
            "deconv padding {padding} consumes the whole {full}-wide output"
        )));
    }
    narrow(full - border)
}

/// Max pooling output extent: `floor(input / stride)`.
pub fn pool_output(input: u32, stride: u32) -> Result<u32> {
    if stride == 0 {
        return Err(Error::configuration("maxpool stride must be non-zero"));
    }
    let out = input / stride;
    if out == 0 {
        return Err(Error::configuration(format!(
            "maxpool stride {stride} exceeds input {input}"
        )));
    }
    Ok(out)
}

fn narrow(value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::configuration(format!("extent {value} exceeds u32")))
}

/// Resolved matrix dimensions of a MatMad call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatDims {
    /// Rows of the result (and of A as read).
    pub m: u32,
    /// Columns of the result (and of B as read).
    pub n: u32,
    /// Shared inner dimension.
    pub k: u32,
    /// Number of B matrices.
    pub batch: u32,
    /// Whether each batch entry has its own A.
    pub batched_a: bool,
}

/// Resolve MatMad dimensions.
///
/// A matrix is stored `height` rows of `width` columns; batches run over
/// `depth × layers`. With `transpose` both operands are read transposed,
/// so the result is `Aᵀ·Bᵀ`.
pub fn mat_dims(a: &TensorDesc, b: &TensorDesc, transpose: bool) -> Result<MatDims> {
    let (m, k) = if transpose {
        (a.width, a.height)
    } else {
        (a.height, a.width)
    };
    let (kb, n) = if transpose {
        (b.width, b.height)
    } else {
        (b.height, b.width)
    };
    if k != kb {
        return Err(Error::configuration(format!(
            "mat_mad inner dimensions differ: A {a} gives {k}, B {b} gives {kb}"
        )));
    }

    let batch = b.depth * b.layers;
    let a_batch = a.depth * a.layers;
    if a_batch != 1 && a_batch != batch {
        return Err(Error::configuration(format!(
            "mat_mad A has {a_batch} matrices but B has {batch}"
        )));
    }

    Ok(MatDims {
        m,
        n,
        k,
        batch,
        batched_a: a_batch != 1,
    })
}

/// Infer the output shape `[width, height, depth, layers]` of `operation`.
///
/// Checks operand compatibility (channel counts, per-channel vector lengths,
/// inner dimensions). `output_padding` is the destination's padding and only
/// affects DeConv.
pub fn infer_output(
    operation: Operation,
    sources: &[TensorDesc],
    flags: DispatchFlags,
    output_padding: u32,
) -> Result<[u32; 4]> {
    let input = &sources[0];
    match operation {
        Operation::Conv => {
            let weight = &sources[1];
            if weight.depth != input.depth {
                return Err(Error::configuration(format!(
                    "conv weight {weight} expects {} input channels, input {input} has {}",
                    weight.depth, input.depth
                )));
            }
            check_bias(operation, sources.get(2), weight.layers)?;
            Ok([
                conv_output(input.width, weight.width, input.stride, input.padding)?,
                conv_output(input.height, weight.height, input.stride, input.padding)?,
                weight.layers,
                input.layers,
            ])
        }
        Operation::DeConv => {
            let weight = &sources[1];
            if weight.layers != input.depth {
                return Err(Error::configuration(format!(
                    "deconv weight {weight} expects {} input channels, input {input} has {}",
                    weight.layers, input.depth
                )));
            }
            check_bias(operation, sources.get(2), weight.depth)?;
            Ok([
                deconv_output(
                    input.width,
                    weight.width,
                    input.stride,
                    input.padding,
                    output_padding,
                )?,
                deconv_output(
                    input.height,
                    weight.height,
                    input.stride,
                    input.padding,
                    output_padding,
                )?,
                weight.depth,
                input.layers,
            ])
        }
        Operation::MaxPool => {
            if input.padding != 0 {
                return Err(Error::configuration(format!(
                    "maxpool does not support padding, input {input} has {}",
                    input.padding
                )));
            }
            Ok([
                pool_output(input.width, input.stride)?,
                pool_output(input.height, input.stride)?,
                input.depth,
                input.layers,
            ])
        }
        Operation::BatchNorm | Operation::BatchMad => {
            for channel in &sources[1..] {
                check_channel_vector(operation, channel, input.depth)?;
            }
            Ok(input.dims())
        }
        Operation::MatMad => {
            let dims = mat_dims(input, &sources[1], flags.contains(DispatchFlags::TRANSPOSE))?;
            check_bias(operation, sources.get(2), dims.m)?;
            Ok([dims.n, dims.m, sources[1].depth, sources[1].layers])
        }
    }
}

fn check_bias(operation: Operation, bias: Option<&TensorDesc>, expected: u32) -> Result<()> {
    match bias {
        Some(bias) => check_channel_vector(operation, bias, expected),
        None => Ok(()),
    }
}

fn check_channel_vector(operation: Operation, vector: &TensorDesc, expected: u32) -> Result<()> {
    if vector.elements() != expected as u64 {
        return Err(Error::configuration(format!(
            "{operation} expects a {expected}-element vector, got {vector}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conv_output_sizes() {
        assert_eq!(conv_output(64, 5, 3, 2).unwrap(), 22);
        assert_eq!(conv_output(21, 3, 2, 2).unwrap(), 12);
        assert_eq!(conv_output(28, 3, 2, 1).unwrap(), 14);
        assert_eq!(conv_output(5, 3, 1, 1).unwrap(), 5);
        assert!(conv_output(2, 5, 1, 1).is_err());
        assert!(conv_output(8, 3, 0, 0).is_err());
    }

    #[test]
    fn test_deconv_inverts_conv() {
        // k3 s1 p1 preserves the extent in both directions
        for n in 1..16 {
            let down = conv_output(n, 3, 1, 1).unwrap();
            assert_eq!(down, n);
            assert_eq!(deconv_output(down, 3, 1, 1, 0).unwrap(), n);
        }
        // Strided deconv recovers the smallest matching input; output padding the rest
        assert_eq!(conv_output(8, 3, 2, 1).unwrap(), 4);
        assert_eq!(deconv_output(4, 3, 2, 1, 0).unwrap(), 7);
        assert_eq!(deconv_output(4, 3, 2, 1, 1).unwrap(), 8);
    }

    #[test]
    fn test_denoiser_decoder_reaches_tile_size() {
        let mut size = 64;
        for (k, s, p) in [(5, 3, 2), (3, 2, 2), (3, 2, 1), (3, 1, 1)] {
            size = conv_output(size, k, s, p).unwrap();
        }
        assert_eq!(size, 6);
        for (k, s, p, op) in [(3, 1, 1, 0), (3, 2, 1, 0), (3, 2, 1, 0), (5, 3, 1, 1)] {
            size = deconv_output(size, k, s, p, op).unwrap();
        }
        assert_eq!(size, 64);
    }

    #[test]
    fn test_deconv_rejects_large_output_padding() {
        assert!(deconv_output(4, 3, 2, 1, 2).is_err());
        assert!(deconv_output(1, 1, 1, 1, 0).is_err());
    }

    #[test]
    fn test_pool_output() {
        assert_eq!(pool_output(14, 2).unwrap(), 7);
        assert_eq!(pool_output(7, 2).unwrap(), 3);
        assert!(pool_output(1, 2).is_err());
    }

    #[test]
    fn test_mat_dims_plain_and_transposed() {
        let w = TensorDesc::new(384, 10, 1, 1);
        let x = TensorDesc::new(1, 384, 1, 4);
        let dims = mat_dims(&w, &x, false).unwrap();
        assert_eq!((dims.m, dims.n, dims.k, dims.batch), (10, 1, 384, 4));
        assert!(!dims.batched_a);

        let at = TensorDesc::new(10, 384, 1, 1);
        let bt = TensorDesc::new(384, 1, 1, 4);
        assert_eq!(mat_dims(&at, &bt, true).unwrap(), dims);

        assert!(mat_dims(&w, &TensorDesc::new(1, 100, 1, 1), false).is_err());
        assert!(mat_dims(&TensorDesc::new(384, 10, 1, 2), &x, false).is_err());
    }

    #[test]
    fn test_infer_checks_channels() {
        let input = TensorDesc::new(28, 28, 1, 2).with_stride(2).with_padding(1);
        let weight = TensorDesc::new(3, 3, 1, 16);
        let out = infer_output(Operation::Conv, &[input, weight], DispatchFlags::RELU, 0).unwrap();
        assert_eq!(out, [14, 14, 16, 2]);

        let bad_weight = TensorDesc::new(3, 3, 2, 16);
        assert!(infer_output(Operation::Conv, &[input, bad_weight], DispatchFlags::empty(), 0).is_err());

        let bias = TensorDesc::new(8, 1, 1, 1);
        assert!(
            infer_output(Operation::Conv, &[input, weight, bias], DispatchFlags::empty(), 0).is_err()
        );

        let act = TensorDesc::new(7, 7, 16, 2);
        let short = TensorDesc::new(15, 1, 1, 1);
        let full = TensorDesc::new(16, 1, 1, 1);
        assert!(infer_output(Operation::BatchMad, &[act, full, short], DispatchFlags::empty(), 0).is_err());
        assert_eq!(
            infer_output(Operation::BatchNorm, &[act, full, full], DispatchFlags::empty(), 0).unwrap(),
            [7, 7, 16, 2]
        );
    }

    #[test]
    fn test_maxpool_rejects_padding() {
        let input = TensorDesc::new(8, 8, 1, 1).with_stride(2).with_padding(1);
        assert!(infer_output(Operation::MaxPool, &[input], DispatchFlags::empty(), 0).is_err());
    }
}
