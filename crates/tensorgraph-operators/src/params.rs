//! Uniform block shared by every kernel.

use bytemuck::{Pod, Zeroable};

/// Per-dispatch parameters, bound as `var<uniform> params: Params`.
///
/// Layout matches the WGSL `Params` struct in `shaders/common.wgsl`: six
/// `vec4<u32>`. Offsets are in elements of the bound operand's format.
///
/// | Field | Tensor kernels | Image kernels |
/// |---|---|---|
/// | `dst_shape` | output w, h, d, l | tensor or image extent |
/// | `src_shape` | first operand w, h, d, l | tensor or image extent |
/// | `aux_shape` | second operand w, h, d, l | unused |
/// | `offsets` | dst, src, aux0, aux1 | dst, src |
/// | `window` | kernel specific, `z` = activation | tiles per row |
/// | `formats` | src, aux0, aux1, has_aux1 | src |
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct KernelParams {
    pub dst_shape: [u32; 4],
    pub src_shape: [u32; 4],
    pub aux_shape: [u32; 4],
    pub offsets: [u32; 4],
    pub window: [u32; 4],
    pub formats: [u32; 4],
}

impl KernelParams {
    /// Size of the uniform block in bytes.
    pub const SIZE: u64 = std::mem::size_of::<KernelParams>() as u64;

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}
