//! Dispatch planning.
//!
//! Planning turns an operator call (destination, sources, flags) into a
//! [`KernelCall`]: the uniform block, the buffers to bind and the group
//! counts. Every check a dispatch needs happens here, before anything is
//! recorded, so an invalid call never reaches a device:
//!
//! - operand count, shapes and channel compatibility (see [`crate::shape`])
//! - every operand bound to a known buffer and inside its capacity
//! - destination not sharing a buffer with any source
//! - at most one fused activation, only where the operator accepts one
//! - binary16 sources only when the engine allows them; f32 destinations
//! - group counts within the per-dimension limit
//!
//! Both the device dispatcher and [`CpuGraph`](crate::CpuGraph) execute the
//! same plans.

use crate::config::EngineConfig;
use crate::kernel::Kernel;
use crate::operation::Operation;
use crate::params::KernelParams;
use crate::shape;
use tensorgraph_core::{Activation, BufferId, DispatchFlags, Error, Format, Result, TensorDesc};

/// Capacity lookup for the buffers a dispatcher owns.
pub trait BufferTable {
    /// Size in bytes of `buffer`, `None` if the handle is unknown.
    fn capacity(&self, buffer: BufferId) -> Option<u64>;
}

/// Size of an image in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageExtent {
    pub width: u32,
    pub height: u32,
}

impl ImageExtent {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Whole `tile × tile` squares per row and per column.
    pub fn tiles(&self, tile_width: u32, tile_height: u32) -> (u32, u32) {
        if tile_width == 0 || tile_height == 0 {
            return (0, 0);
        }
        (self.width / tile_width, self.height / tile_height)
    }

    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// A fully validated kernel invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelCall {
    pub kernel: Kernel,
    pub params: KernelParams,
    /// Group counts for `dispatch_workgroups`.
    pub workgroups: [u32; 3],
    /// Destination (or in-place tensor) with its final shape, stride 1 and
    /// padding 0.
    pub output: TensorDesc,
    /// Buffers for the storage buffer bindings, in binding order.
    ///
    /// Texture bindings are supplied by the caller.
    pub buffers: Vec<BufferId>,
}

/// Plan a tensor operator.
///
/// An unshaped `dst` receives the computed shape. A shaped `dst` must match
/// it exactly; for DeConv the destination's padding is the output padding
/// added to the bottom/right edge.
pub fn plan_operation(
    operation: Operation,
    dst: &TensorDesc,
    sources: &[TensorDesc],
    flags: DispatchFlags,
    buffers: &impl BufferTable,
    config: &EngineConfig,
) -> Result<KernelCall> {
    if !operation.operands().contains(&sources.len()) {
        return Err(Error::configuration(format!(
            "{operation} takes {:?} operands, got {}",
            operation.operands(),
            sources.len()
        )));
    }

    let activation = flags.activation()?;
    if activation != Activation::None && !operation.accepts_activation() {
        return Err(Error::configuration(format!(
            "{operation} does not accept a fused activation"
        )));
    }
    let transpose = flags.contains(DispatchFlags::TRANSPOSE);
    if transpose && operation != Operation::MatMad {
        return Err(Error::configuration(format!(
            "transpose flag is only valid for mat_mad, got {operation}"
        )));
    }

    let mut source_buffers = Vec::with_capacity(sources.len());
    for (index, source) in sources.iter().enumerate() {
        if !source.is_shaped() {
            return Err(Error::configuration(format!(
                "{operation} operand {index} {source} has no shape"
            )));
        }
        check_source_format(operation, index, source, config)?;
        source_buffers.push(bound(source, buffers)?);
    }

    let input = &sources[0];
    if !operation.is_windowed() && (input.stride != 1 || input.padding != 0) {
        return Err(Error::configuration(format!(
            "{operation} ignores stride and padding, input {input} has stride {} padding {}",
            input.stride, input.padding
        )));
    }

    let output_padding = match operation {
        Operation::DeConv => dst.padding,
        _ if dst.padding != 0 || dst.stride != 1 => {
            return Err(Error::configuration(format!(
                "{operation} destination {dst} must not carry stride or padding"
            )));
        }
        _ => 0,
    };

    let [w, h, d, l] = shape::infer_output(operation, sources, flags, output_padding)?;
    let output = resolve_destination(operation, dst, [w, h, d, l])?;
    let dst_buffer = bound(&output, buffers)?;
    if output.format != Format::F32 {
        return Err(Error::configuration(format!(
            "{operation} destination {output} must be f32"
        )));
    }
    if let Some(index) = source_buffers.iter().position(|&b| b == dst_buffer) {
        return Err(Error::configuration(format!(
            "{operation} destination {output} aliases operand {index} {}",
            sources[index]
        )));
    }

    let operand = |index: usize| sources.get(index).unwrap_or(input);
    let aux0 = operand(1);
    let aux1 = sources.get(2);

    let mut params = KernelParams {
        dst_shape: output.dims(),
        src_shape: input.dims(),
        aux_shape: aux0.dims(),
        offsets: [
            element_offset(&output)?,
            element_offset(input)?,
            element_offset(aux0)?,
            aux1.map(element_offset).transpose()?.unwrap_or(0),
        ],
        window: [input.stride, input.padding, activation.code(), 0],
        formats: [
            input.format.code(),
            aux0.format.code(),
            aux1.map_or(input.format, |t| t.format).code(),
            aux1.is_some() as u32,
        ],
    };

    let workgroups = if operation == Operation::MatMad {
        let dims = shape::mat_dims(input, aux0, transpose)?;
        let a_stride = if dims.batched_a { dims.m * dims.k } else { 0 };
        params.window = [dims.k, a_stride, activation.code(), transpose as u32];
        grid(config, dims.n, dims.m, dims.batch)?
    } else {
        let slices = d.checked_mul(l).ok_or_else(|| {
            Error::Shape(format!("{w}x{h}x{d}x{l} output has too many slices"))
        })?;
        grid(config, w, h, slices)?
    };

    let buffers = vec![
        dst_buffer,
        source_buffers[0],
        *source_buffers.get(1).unwrap_or(&source_buffers[0]),
        *source_buffers.get(2).unwrap_or(&source_buffers[0]),
    ];

    Ok(KernelCall {
        kernel: operation.into(),
        params,
        workgroups,
        output,
        buffers,
    })
}

/// Plan an in-place round trip of `tensor` through binary16.
pub fn plan_quantize(
    tensor: &TensorDesc,
    buffers: &impl BufferTable,
    config: &EngineConfig,
) -> Result<KernelCall> {
    if !tensor.is_shaped() {
        return Err(Error::configuration(format!("cannot quantize unshaped {tensor}")));
    }
    if tensor.format != Format::F32 {
        return Err(Error::configuration(format!(
            "quantize works in place on f32 tensors, got {tensor}"
        )));
    }
    let buffer = bound(tensor, buffers)?;

    let count = u32::try_from(tensor.elements())
        .map_err(|_| Error::configuration(format!("{tensor} is too large to quantize")))?;
    let threads = config.group_threads();
    let needed = count.div_ceil(threads);
    let groups_x = needed.clamp(1, config.max_groups_per_dimension);
    let groups_y = needed.div_ceil(groups_x).max(1);
    if groups_y > config.max_groups_per_dimension {
        return Err(Error::configuration(format!(
            "quantizing {tensor} needs {needed} groups"
        )));
    }

    let output = tensor.with_stride(1).with_padding(0);
    Ok(KernelCall {
        kernel: Kernel::Quantize,
        params: KernelParams {
            dst_shape: [count, 0, 0, 0],
            offsets: [element_offset(tensor)?, 0, 0, 0],
            window: [groups_x * threads, 0, 0, 0],
            ..Default::default()
        },
        workgroups: [groups_x, groups_y, 1],
        output,
        buffers: vec![buffer],
    })
}

/// Plan the split of an image into `dst.layers` tiles of `dst.width × dst.height`.
///
/// Tiles are taken in row-major order; `dst.depth` channels (1 to 4) are
/// copied from each pixel.
pub fn plan_image_to_tensor(
    dst: &TensorDesc,
    image: ImageExtent,
    buffers: &impl BufferTable,
    config: &EngineConfig,
) -> Result<KernelCall> {
    check_image_tensor("image_to_tensor destination", dst, image)?;
    if dst.format != Format::F32 {
        return Err(Error::configuration(format!(
            "image_to_tensor destination {dst} must be f32"
        )));
    }
    let buffer = bound(dst, buffers)?;
    let (tiles_x, _) = image.tiles(dst.width, dst.height);

    let output = dst.with_stride(1).with_padding(0);
    Ok(KernelCall {
        kernel: Kernel::ImageToTensor,
        params: KernelParams {
            dst_shape: dst.dims(),
            src_shape: [image.width, image.height, 0, 0],
            offsets: [element_offset(dst)?, 0, 0, 0],
            window: [tiles_x, 0, 0, 0],
            ..Default::default()
        },
        workgroups: grid(config, dst.width, dst.height, dst.layers)?,
        output,
        buffers: vec![buffer],
    })
}

/// Plan the assembly of `src` layers into image tiles.
pub fn plan_tensor_to_image(
    image: ImageExtent,
    src: &TensorDesc,
    buffers: &impl BufferTable,
    config: &EngineConfig,
) -> Result<KernelCall> {
    check_image_tensor("tensor_to_image source", src, image)?;
    if src.format == Format::F16 && !config.allow_f16 {
        return Err(Error::configuration(format!(
            "tensor_to_image source {src} is f16 but f16 operands are disabled"
        )));
    }
    let buffer = bound(src, buffers)?;
    let (tiles_x, _) = image.tiles(src.width, src.height);

    Ok(KernelCall {
        kernel: Kernel::TensorToImage,
        params: KernelParams {
            dst_shape: [image.width, image.height, 0, 0],
            src_shape: src.dims(),
            offsets: [0, element_offset(src)?, 0, 0],
            window: [tiles_x, 0, 0, 0],
            formats: [src.format.code(), 0, 0, 0],
            ..Default::default()
        },
        workgroups: grid(config, src.width, src.height, src.layers)?,
        output: *src,
        buffers: vec![buffer],
    })
}

fn check_image_tensor(role: &str, tensor: &TensorDesc, image: ImageExtent) -> Result<()> {
    if !tensor.is_shaped() {
        return Err(Error::configuration(format!("{role} {tensor} has no shape")));
    }
    if !(1..=4).contains(&tensor.depth) {
        return Err(Error::configuration(format!(
            "{role} {tensor} must have 1 to 4 channels"
        )));
    }
    let (tiles_x, tiles_y) = image.tiles(tensor.width, tensor.height);
    if (tensor.layers as u64) > tiles_x as u64 * tiles_y as u64 {
        return Err(Error::configuration(format!(
            "{role} {tensor} needs {} tiles but a {}x{} image holds {tiles_x}x{tiles_y}",
            tensor.layers, image.width, image.height
        )));
    }
    Ok(())
}

fn check_source_format(
    operation: Operation,
    index: usize,
    source: &TensorDesc,
    config: &EngineConfig,
) -> Result<()> {
    if source.format == Format::F16 && !config.allow_f16 {
        return Err(Error::configuration(format!(
            "{operation} operand {index} {source} is f16 but f16 operands are disabled"
        )));
    }
    Ok(())
}

fn resolve_destination(operation: Operation, dst: &TensorDesc, dims: [u32; 4]) -> Result<TensorDesc> {
    let [w, h, d, l] = dims;
    if dst.dims() != [0; 4] && dst.dims() != dims {
        return Err(Error::configuration(format!(
            "{operation} produces [{w}x{h}x{d}x{l}] but destination is {dst}"
        )));
    }
    Ok(dst.with_shape(w, h, d, l).with_stride(1).with_padding(0))
}

/// The bound buffer of `tensor`, after checking the view fits it.
fn bound(tensor: &TensorDesc, buffers: &impl BufferTable) -> Result<BufferId> {
    let buffer = tensor
        .buffer
        .ok_or_else(|| Error::configuration(format!("{tensor} is not bound to a buffer")))?;
    let capacity = buffers
        .capacity(buffer)
        .ok_or_else(|| Error::configuration(format!("{tensor} refers to unknown {buffer}")))?;
    tensor.check_fits(capacity)?;
    Ok(buffer)
}

fn element_offset(tensor: &TensorDesc) -> Result<u32> {
    u32::try_from(tensor.element_offset())
        .map_err(|_| Error::configuration(format!("{tensor} offset exceeds the addressable range")))
}

fn grid(config: &EngineConfig, x: u32, y: u32, z: u32) -> Result<[u32; 3]> {
    let [gx, gy] = config.group_size;
    let groups = [x.div_ceil(gx), y.div_ceil(gy), z];
    if groups.iter().any(|&g| g > config.max_groups_per_dimension) {
        return Err(Error::configuration(format!(
            "dispatch of {groups:?} groups exceeds the limit of {} per dimension",
            config.max_groups_per_dimension
        )));
    }
    Ok(groups)
}
