//! Host reference executor.
//!
//! `CpuGraph` owns word-addressed buffers and runs every [`KernelCall`] the
//! planner produces with the same index arithmetic as the WGSL kernels.
//! It is the oracle device results are compared against, and lets the
//! operator semantics be tested without an adapter.

use crate::config::EngineConfig;
use crate::kernel::{ImageFormat, Kernel};
use crate::operation::Operation;
use crate::params::KernelParams;
use crate::plan::{self, BufferTable, ImageExtent, KernelCall};
use half::f16;
use tensorgraph_core::{Activation, BufferId, DispatchFlags, Error, Format, Result, TensorDesc};
use tracing::trace;

/// RGBA pixels of a host image, row-major.
pub type Pixels = Vec<[f32; 4]>;

/// A dispatcher over host memory.
#[derive(Debug, Clone)]
pub struct CpuGraph {
    config: EngineConfig,
    buffers: Vec<Vec<u32>>,
    dispatches: usize,
}

impl BufferTable for CpuGraph {
    fn capacity(&self, buffer: BufferId) -> Option<u64> {
        self.buffers
            .get(buffer.0 as usize)
            .map(|words| words.len() as u64 * 4)
    }
}

impl CpuGraph {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            buffers: Vec::new(),
            dispatches: 0,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of kernels executed so far.
    pub fn dispatch_count(&self) -> usize {
        self.dispatches
    }

    /// Allocate a zeroed buffer of at least `size` bytes.
    pub fn create_buffer(&mut self, size: u64) -> BufferId {
        self.push(vec![0; size.div_ceil(4) as usize])
    }

    /// Allocate a buffer holding `values`.
    pub fn create_buffer_init(&mut self, values: &[f32]) -> BufferId {
        self.push(values.iter().map(|v| v.to_bits()).collect())
    }

    /// Allocate a buffer holding raw little-endian `bytes`, zero-padded to a word.
    pub fn create_buffer_bytes(&mut self, bytes: &[u8]) -> BufferId {
        let words = bytes
            .chunks(4)
            .map(|chunk| {
                let mut word = [0u8; 4];
                word[..chunk.len()].copy_from_slice(chunk);
                u32::from_le_bytes(word)
            })
            .collect();
        self.push(words)
    }

    fn push(&mut self, words: Vec<u32>) -> BufferId {
        self.buffers.push(words);
        BufferId(self.buffers.len() as u32 - 1)
    }

    /// Overwrite the elements of an f32 `tensor`.
    pub fn write(&mut self, tensor: &TensorDesc, values: &[f32]) -> Result<()> {
        if tensor.format != Format::F32 {
            return Err(Error::Format(format!("host writes are f32 only, got {tensor}")));
        }
        if values.len() as u64 != tensor.elements() {
            return Err(Error::configuration(format!(
                "{tensor} holds {} elements, got {}",
                tensor.elements(),
                values.len()
            )));
        }
        let words = self.words_mut(tensor)?;
        for (word, value) in words.iter_mut().zip(values) {
            *word = value.to_bits();
        }
        Ok(())
    }

    /// Elements of `tensor` widened to f32.
    pub fn read(&self, tensor: &TensorDesc) -> Result<Vec<f32>> {
        let words = self.buffer_of(tensor)?;
        tensor.check_fits(words.len() as u64 * 4)?;
        let start = tensor.element_offset() as u32;
        let format = tensor.format.code();
        Ok((0..tensor.elements() as u32)
            .map(|i| decode(words, start + i, format))
            .collect())
    }

    /// Run one operator. `dst` receives the output shape.
    pub fn dispatch(
        &mut self,
        operation: Operation,
        dst: &mut TensorDesc,
        sources: &[TensorDesc],
        flags: DispatchFlags,
    ) -> Result<()> {
        let call = plan::plan_operation(operation, dst, sources, flags, &*self, &self.config)?;
        self.execute(&call, None)?;
        *dst = call.output;
        Ok(())
    }

    /// Round every element of `tensor` through binary16 in place.
    pub fn quantize(&mut self, tensor: &TensorDesc) -> Result<()> {
        let call = plan::plan_quantize(tensor, &*self, &self.config)?;
        self.execute(&call, None)
    }

    /// Split `pixels` (an `extent` image) into the tiles of `dst`.
    pub fn image_to_tensor(
        &mut self,
        dst: &TensorDesc,
        extent: ImageExtent,
        pixels: &[[f32; 4]],
    ) -> Result<()> {
        if pixels.len() as u64 != extent.pixels() {
            return Err(Error::configuration(format!(
                "{}x{} image needs {} pixels, got {}",
                extent.width,
                extent.height,
                extent.pixels(),
                pixels.len()
            )));
        }
        let call = plan::plan_image_to_tensor(dst, extent, &*self, &self.config)?;
        self.execute(&call, Some(pixels))
    }

    /// Assemble the layers of `src` into a new `extent` image.
    ///
    /// Pixels not covered by a tile stay transparent black.
    pub fn tensor_to_image(&mut self, extent: ImageExtent, src: &TensorDesc) -> Result<Pixels> {
        let call = plan::plan_tensor_to_image(extent, src, &*self, &self.config)?;
        let words = self.buffer_of(src)?;
        let p = &call.params;
        let [w, h, depth, layers] = p.src_shape;
        let tiles_x = p.window[0];
        let format = p.formats[0];

        let mut pixels = vec![[0.0; 4]; extent.pixels() as usize];
        for l in 0..layers {
            for y in 0..h {
                for x in 0..w {
                    let mut color = [0.0, 0.0, 0.0, 1.0];
                    for c in 0..depth.min(4) {
                        let index = p.offsets[1] + ((l * depth + c) * h + y) * w + x;
                        color[c as usize] = decode(words, index, format);
                    }
                    if depth == 1 {
                        color = [color[0], color[0], color[0], 1.0];
                    }
                    let px = (l % tiles_x) * w + x;
                    let py = (l / tiles_x) * h + y;
                    pixels[(py * extent.width + px) as usize] =
                        color.map(|v| store_channel(self.config.image_format, v));
                }
            }
        }
        self.dispatches += 1;
        Ok(pixels)
    }

    fn execute(&mut self, call: &KernelCall, image: Option<&[[f32; 4]]>) -> Result<()> {
        trace!(kernel = %call.kernel, workgroups = ?call.workgroups, "cpu dispatch");
        if call.kernel == Kernel::ImageToTensor && image.is_none() {
            return Err(Error::configuration("image_to_tensor needs an image"));
        }

        let dst_index = call.buffers[0].0 as usize;
        let mut dst = std::mem::take(&mut self.buffers[dst_index]);
        let sources: Vec<&[u32]> = call.buffers[1..]
            .iter()
            .map(|b| self.buffers[b.0 as usize].as_slice())
            .collect();

        let p = &call.params;
        match call.kernel {
            Kernel::Quantize => quantize(p, &mut dst),
            Kernel::ImageToTensor => image_to_tensor(p, image.unwrap_or_default(), &mut dst),
            // Reads only; assembled directly by `tensor_to_image`
            Kernel::TensorToImage => {}
            kernel => {
                let operands = Operands {
                    params: p,
                    src: sources[0],
                    aux0: sources[1],
                    aux1: sources[2],
                };
                let activation = Activation::from_code(p.window[2]).unwrap_or_default();
                let [w, h, d, l] = p.dst_shape;
                for z in 0..d * l {
                    for y in 0..h {
                        for x in 0..w {
                            let value = match kernel {
                                Kernel::Conv => operands.conv(x, y, z),
                                Kernel::DeConv => operands.deconv(x, y, z),
                                Kernel::MaxPool => operands.maxpool(x, y, z),
                                Kernel::BatchNorm => operands.batch_norm(x, y, z),
                                Kernel::BatchMad => operands.batch_mad(x, y, z),
                                _ => operands.mat_mad(x, y, z),
                            };
                            let index = p.offsets[0] + (z * h + y) * w + x;
                            dst[index as usize] = activation.apply(value).to_bits();
                        }
                    }
                }
            }
        }

        self.buffers[dst_index] = dst;
        self.dispatches += 1;
        Ok(())
    }

    fn buffer_of(&self, tensor: &TensorDesc) -> Result<&[u32]> {
        tensor
            .buffer
            .and_then(|b| self.buffers.get(b.0 as usize))
            .map(Vec::as_slice)
            .ok_or_else(|| Error::configuration(format!("{tensor} is not bound to a host buffer")))
    }

    fn words_mut(&mut self, tensor: &TensorDesc) -> Result<&mut [u32]> {
        let unbound = || Error::configuration(format!("{tensor} is not bound to a host buffer"));
        let buffer = tensor.buffer.ok_or_else(unbound)?;
        let capacity = self.capacity(buffer).ok_or_else(unbound)?;
        tensor.check_fits(capacity)?;
        let start = tensor.element_offset() as usize;
        let end = start + tensor.elements() as usize;
        Ok(&mut self.buffers[buffer.0 as usize][start..end])
    }
}

fn decode(words: &[u32], index: u32, format: u32) -> f32 {
    if format == Format::F16.code() {
        let word = words[(index >> 1) as usize];
        let half = (word >> (16 * (index & 1))) as u16;
        f16::from_bits(half).to_f32()
    } else {
        f32::from_bits(words[index as usize])
    }
}

fn store_channel(format: ImageFormat, value: f32) -> f32 {
    match format {
        ImageFormat::Rgba8Unorm => (value.clamp(0.0, 1.0) * 255.0).round() / 255.0,
        ImageFormat::Rgba32Float => value,
    }
}

fn quantize(p: &KernelParams, dst: &mut [u32]) {
    let start = p.offsets[0] as usize;
    for word in &mut dst[start..start + p.dst_shape[0] as usize] {
        let value = f32::from_bits(*word).clamp(-65504.0, 65504.0);
        *word = f16::from_f32(value).to_f32().to_bits();
    }
}

fn image_to_tensor(p: &KernelParams, pixels: &[[f32; 4]], dst: &mut [u32]) {
    let [w, h, depth, layers] = p.dst_shape;
    let image_width = p.src_shape[0];
    let tiles_x = p.window[0];
    for l in 0..layers {
        for y in 0..h {
            for x in 0..w {
                let px = (l % tiles_x) * w + x;
                let py = (l / tiles_x) * h + y;
                let texel = pixels[(py * image_width + px) as usize];
                for c in 0..depth {
                    let index = p.offsets[0] + ((l * depth + c) * h + y) * w + x;
                    dst[index as usize] = texel[c as usize].to_bits();
                }
            }
        }
    }
}

/// Operand views of one tensor kernel invocation.
struct Operands<'a> {
    params: &'a KernelParams,
    src: &'a [u32],
    aux0: &'a [u32],
    aux1: &'a [u32],
}

impl Operands<'_> {
    fn src(&self, index: u32) -> f32 {
        decode(self.src, index, self.params.formats[0])
    }

    fn aux0(&self, index: u32) -> f32 {
        decode(self.aux0, index, self.params.formats[1])
    }

    fn aux1(&self, index: u32) -> f32 {
        decode(self.aux1, index, self.params.formats[2])
    }

    fn bias(&self, index: u32) -> f32 {
        if self.params.formats[3] != 0 {
            self.aux1(self.params.offsets[3] + index)
        } else {
            0.0
        }
    }

    fn conv(&self, x: u32, y: u32, z: u32) -> f32 {
        let p = self.params;
        let out_depth = p.dst_shape[2];
        let (oc, layer) = (z % out_depth, z / out_depth);
        let [in_w, in_h, in_d, _] = p.src_shape;
        let [k_w, k_h, _, _] = p.aux_shape;
        let stride = p.window[0] as i64;
        let padding = p.window[1] as i64;

        let mut sum = self.bias(oc);
        for ic in 0..in_d {
            let plane = p.offsets[1] + (layer * in_d + ic) * in_h * in_w;
            let taps = p.offsets[2] + (oc * in_d + ic) * k_h * k_w;
            for ky in 0..k_h {
                let iy = y as i64 * stride + ky as i64 - padding;
                if iy < 0 || iy >= in_h as i64 {
                    continue;
                }
                for kx in 0..k_w {
                    let ix = x as i64 * stride + kx as i64 - padding;
                    if ix < 0 || ix >= in_w as i64 {
                        continue;
                    }
                    sum += self.src(plane + iy as u32 * in_w + ix as u32)
                        * self.aux0(taps + ky * k_w + kx);
                }
            }
        }
        sum
    }

    fn deconv(&self, x: u32, y: u32, z: u32) -> f32 {
        let p = self.params;
        let out_depth = p.dst_shape[2];
        let (oc, layer) = (z % out_depth, z / out_depth);
        let [in_w, in_h, in_d, _] = p.src_shape;
        let [k_w, k_h, _, _] = p.aux_shape;
        let stride = p.window[0] as i64;
        let padding = p.window[1] as i64;

        let mut sum = self.bias(oc);
        for ky in 0..k_h {
            let ty = y as i64 + padding - ky as i64;
            if ty < 0 || ty % stride != 0 || ty / stride >= in_h as i64 {
                continue;
            }
            let iy = (ty / stride) as u32;
            for kx in 0..k_w {
                let tx = x as i64 + padding - kx as i64;
                if tx < 0 || tx % stride != 0 || tx / stride >= in_w as i64 {
                    continue;
                }
                let ix = (tx / stride) as u32;
                for ic in 0..in_d {
                    let input = p.offsets[1] + ((layer * in_d + ic) * in_h + iy) * in_w + ix;
                    let weight = p.offsets[2] + ((ic * out_depth + oc) * k_h + ky) * k_w + kx;
                    sum += self.src(input) * self.aux0(weight);
                }
            }
        }
        sum
    }

    fn maxpool(&self, x: u32, y: u32, z: u32) -> f32 {
        let p = self.params;
        let [in_w, in_h, _, _] = p.src_shape;
        let stride = p.window[0];
        let plane = p.offsets[1] + z * in_h * in_w;
        let mut best = f32::NEG_INFINITY;
        for ky in 0..stride {
            for kx in 0..stride {
                best = best.max(self.src(plane + (y * stride + ky) * in_w + x * stride + kx));
            }
        }
        best
    }

    fn element(&self, x: u32, y: u32, z: u32) -> (f32, u32) {
        let p = self.params;
        let [w, h, depth, _] = p.src_shape;
        let value = self.src(p.offsets[1] + (z * h + y) * w + x);
        (value, z % depth)
    }

    fn batch_norm(&self, x: u32, y: u32, z: u32) -> f32 {
        let p = self.params;
        let (value, channel) = self.element(x, y, z);
        let mean = self.aux0(p.offsets[2] + channel);
        let variance = self.aux1(p.offsets[3] + channel);
        (value - mean) / (variance + 1e-5).sqrt()
    }

    fn batch_mad(&self, x: u32, y: u32, z: u32) -> f32 {
        let p = self.params;
        let (value, channel) = self.element(x, y, z);
        value * self.aux0(p.offsets[2] + channel) + self.aux1(p.offsets[3] + channel)
    }

    fn mat_mad(&self, n: u32, m: u32, batch: u32) -> f32 {
        let p = self.params;
        let n_cols = p.dst_shape[0];
        let m_rows = p.dst_shape[1];
        let [k, a_stride, _, transpose] = p.window;
        let a_base = p.offsets[1] + batch * a_stride;
        let b_base = p.offsets[2] + batch * k * n_cols;

        let (a_start, a_step, b_start, b_step) = if transpose != 0 {
            (a_base + m, m_rows, b_base + n * k, 1)
        } else {
            (a_base + m * k, 1, b_base + n, n_cols)
        };

        let mut sum = self.bias(m);
        for i in 0..k {
            sum += self.src(a_start + i * a_step) * self.aux0(b_start + i * b_step);
        }
        sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn graph() -> CpuGraph {
        CpuGraph::new(EngineConfig::default()).unwrap()
    }

    fn random(rng: &mut StdRng, count: usize) -> Vec<f32> {
        (0..count).map(|_| rng.random_range(-1.0..1.0)).collect()
    }

    fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
        assert_eq!(actual.len(), expected.len());
        for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
            assert!(
                (a - e).abs() <= tolerance,
                "element {i}: got {a}, expected {e}"
            );
        }
    }

    /// Input tensor on a fresh buffer.
    fn tensor(graph: &mut CpuGraph, dims: [u32; 4], values: &[f32]) -> TensorDesc {
        let buffer = graph.create_buffer_init(values);
        TensorDesc::with_size(buffer, dims[0], dims[1], dims[2], dims[3])
    }

    fn output(graph: &mut CpuGraph) -> TensorDesc {
        TensorDesc::on(graph.create_buffer(1 << 16))
    }

    #[test]
    fn test_conv_box_filter() {
        let mut g = graph();
        let input = tensor(&mut g, [3, 3, 1, 1], &[1., 2., 3., 4., 5., 6., 7., 8., 9.]);
        let weight = tensor(&mut g, [2, 2, 1, 1], &[1.0; 4]);
        let mut dst = output(&mut g);

        g.dispatch(Operation::Conv, &mut dst, &[input, weight], DispatchFlags::empty())
            .unwrap();
        assert_eq!(dst.dims(), [2, 2, 1, 1]);
        assert_eq!(g.read(&dst).unwrap(), vec![12.0, 16.0, 24.0, 28.0]);
    }

    #[test]
    fn test_conv_identity_then_deconv_preserves_shape() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut g = graph();
        let values = random(&mut rng, 9 * 7 * 2 * 3);
        let input = tensor(&mut g, [9, 7, 2, 3], &values);

        // Centre tap 1 on the matching channel: identity convolution
        let mut taps = vec![0.0; 3 * 3 * 2 * 2];
        taps[4] = 1.0;
        taps[(2 + 1) * 9 + 4] = 1.0;
        let weight = tensor(&mut g, [3, 3, 2, 2], &taps);

        let mut conv = output(&mut g);
        g.dispatch(
            Operation::Conv,
            &mut conv,
            &[input.with_padding(1), weight],
            DispatchFlags::empty(),
        )
        .unwrap();
        assert_eq!(conv.dims(), input.dims());
        assert_close(&g.read(&conv).unwrap(), &values, 0.0);

        // Same taps read as in × out describe the same identity for deconv
        let mut deconv = output(&mut g);
        g.dispatch(
            Operation::DeConv,
            &mut deconv,
            &[conv.with_padding(1), weight],
            DispatchFlags::empty(),
        )
        .unwrap();
        assert_eq!(deconv.dims(), input.dims());
        assert_close(&g.read(&deconv).unwrap(), &values, 0.0);
    }

    #[test]
    fn test_deconv_matches_scatter() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut g = graph();
        let (in_w, in_h, in_d, out_d, k, stride, padding) = (5u32, 4u32, 3u32, 2u32, 3u32, 2u32, 1u32);
        let x = random(&mut rng, (in_w * in_h * in_d) as usize);
        let w = random(&mut rng, (k * k * out_d * in_d) as usize);
        let bias = random(&mut rng, out_d as usize);

        let input = tensor(&mut g, [in_w, in_h, in_d, 1], &x)
            .with_stride(stride)
            .with_padding(padding);
        let weight = tensor(&mut g, [k, k, out_d, in_d], &w);
        let bias_t = tensor(&mut g, [out_d, 1, 1, 1], &bias);
        let mut dst = output(&mut g);
        g.dispatch(Operation::DeConv, &mut dst, &[input, weight, bias_t], DispatchFlags::empty())
            .unwrap();

        let out_w = (in_w - 1) * stride + k - 2 * padding;
        let out_h = (in_h - 1) * stride + k - 2 * padding;
        assert_eq!(dst.dims(), [out_w, out_h, out_d, 1]);

        // Scatter every input element through the kernel, then crop the border
        let full_w = (in_w - 1) * stride + k;
        let full_h = (in_h - 1) * stride + k;
        let mut full = vec![0.0f32; (full_w * full_h * out_d) as usize];
        for ic in 0..in_d {
            for iy in 0..in_h {
                for ix in 0..in_w {
                    let v = x[((ic * in_h + iy) * in_w + ix) as usize];
                    for oc in 0..out_d {
                        for ky in 0..k {
                            for kx in 0..k {
                                let wv = w[(((ic * out_d + oc) * k + ky) * k + kx) as usize];
                                let fy = iy * stride + ky;
                                let fx = ix * stride + kx;
                                full[((oc * full_h + fy) * full_w + fx) as usize] += v * wv;
                            }
                        }
                    }
                }
            }
        }
        let mut expected = Vec::new();
        for oc in 0..out_d {
            for y in 0..out_h {
                for x in 0..out_w {
                    let fy = y + padding;
                    let fx = x + padding;
                    expected.push(full[((oc * full_h + fy) * full_w + fx) as usize] + bias[oc as usize]);
                }
            }
        }
        assert_close(&g.read(&dst).unwrap(), &expected, 1e-5);
    }

    #[test]
    fn test_maxpool_block_maxima() {
        let mut g = graph();
        #[rustfmt::skip]
        let values = [
            1., 5., 2., 0.,
            3., 4., 8., 7.,
            -1., -2., 0., 6.,
            -3., -9., 9., 1.,
        ];
        let input = tensor(&mut g, [4, 4, 1, 1], &values);
        let mut dst = output(&mut g);
        g.dispatch(
            Operation::MaxPool,
            &mut dst,
            &[input.with_stride(2)],
            DispatchFlags::empty(),
        )
        .unwrap();
        assert_eq!(dst.dims(), [2, 2, 1, 1]);
        assert_eq!(g.read(&dst).unwrap(), vec![5.0, 8.0, -1.0, 9.0]);
    }

    #[test]
    fn test_batch_norm_then_mad() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut g = graph();
        let values = random(&mut rng, 4 * 4 * 3 * 2);
        let mean = [0.1, -0.2, 0.3];
        let variance = [0.5, 1.5, 0.25];
        let mul = [2.0, -1.0, 0.5];
        let add = [0.0, 0.25, -0.5];

        let input = tensor(&mut g, [4, 4, 3, 2], &values);
        let mean_t = tensor(&mut g, [3, 1, 1, 1], &mean);
        let var_t = tensor(&mut g, [3, 1, 1, 1], &variance);
        let mul_t = tensor(&mut g, [3, 1, 1, 1], &mul);
        let add_t = tensor(&mut g, [3, 1, 1, 1], &add);

        let mut normalized = output(&mut g);
        g.dispatch(
            Operation::BatchNorm,
            &mut normalized,
            &[input, mean_t, var_t],
            DispatchFlags::empty(),
        )
        .unwrap();
        let mut scaled = output(&mut g);
        g.dispatch(
            Operation::BatchMad,
            &mut scaled,
            &[normalized, mul_t, add_t],
            DispatchFlags::empty(),
        )
        .unwrap();

        let expected: Vec<f32> = values
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                let c = (i / 16) % 3;
                (v - mean[c]) / (variance[c] + 1e-5f32).sqrt() * mul[c] + add[c]
            })
            .collect();
        assert_close(&g.read(&scaled).unwrap(), &expected, 1e-5);
    }

    #[test]
    fn test_mat_mad_transposed_storage() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut g = graph();
        let (m, k, n, batch) = (3usize, 5usize, 4usize, 2usize);
        let a = random(&mut rng, m * k);
        let b = random(&mut rng, k * n * batch);
        let bias = random(&mut rng, m);

        let a_t: Vec<f32> = (0..k * m).map(|i| a[(i % m) * k + i / m]).collect();
        let b_t: Vec<f32> = (0..batch * n * k)
            .map(|i| {
                let (bi, r) = (i / (n * k), i % (n * k));
                b[bi * k * n + (r % k) * n + r / k]
            })
            .collect();

        let a_plain = tensor(&mut g, [k as u32, m as u32, 1, 1], &a);
        let b_plain = tensor(&mut g, [n as u32, k as u32, 1, batch as u32], &b);
        let a_stored_t = tensor(&mut g, [m as u32, k as u32, 1, 1], &a_t);
        let b_stored_t = tensor(&mut g, [k as u32, n as u32, 1, batch as u32], &b_t);
        let bias_t = tensor(&mut g, [m as u32, 1, 1, 1], &bias);

        let mut plain = output(&mut g);
        g.dispatch(
            Operation::MatMad,
            &mut plain,
            &[a_plain, b_plain, bias_t],
            DispatchFlags::empty(),
        )
        .unwrap();
        let mut transposed = output(&mut g);
        g.dispatch(
            Operation::MatMad,
            &mut transposed,
            &[a_stored_t, b_stored_t, bias_t],
            DispatchFlags::TRANSPOSE,
        )
        .unwrap();

        assert_eq!(plain.dims(), [n as u32, m as u32, 1, batch as u32]);
        assert_eq!(transposed.dims(), plain.dims());

        let mut expected = Vec::new();
        for bi in 0..batch {
            for row in 0..m {
                for col in 0..n {
                    let dot: f32 = (0..k).map(|i| a[row * k + i] * b[bi * k * n + i * n + col]).sum();
                    expected.push(dot + bias[row]);
                }
            }
        }
        assert_close(&g.read(&plain).unwrap(), &expected, 1e-5);
        assert_close(&g.read(&transposed).unwrap(), &expected, 1e-5);
    }

    #[test]
    fn test_fused_activations() {
        let mut g = graph();
        let input = tensor(&mut g, [3, 1, 1, 1], &[-2.0, 0.0, 2.0]);
        let one = tensor(&mut g, [1, 1, 1, 1], &[1.0]);
        let zero = tensor(&mut g, [1, 1, 1, 1], &[0.0]);

        let run = |g: &mut CpuGraph, flags| {
            let mut dst = TensorDesc::on(g.create_buffer(12));
            g.dispatch(Operation::BatchMad, &mut dst, &[input, one, zero], flags)
                .unwrap();
            g.read(&dst).unwrap()
        };

        assert_eq!(run(&mut g, DispatchFlags::RELU), vec![0.0, 0.0, 2.0]);
        assert_close(
            &run(&mut g, DispatchFlags::SIGMOID),
            &[0.11920292, 0.5, 0.8807971],
            1e-6,
        );
        assert_close(
            &run(&mut g, DispatchFlags::SILU),
            &[-0.23840584, 0.0, 1.7615942],
            1e-6,
        );
    }

    #[test]
    fn test_fused_activations_on_scalar() {
        let mut g = graph();
        let input = tensor(&mut g, [1, 1, 1, 1], &[-2.0]);
        let one = tensor(&mut g, [1, 1, 1, 1], &[1.0]);
        let zero = tensor(&mut g, [1, 1, 1, 1], &[0.0]);

        for (flags, expected) in [
            (DispatchFlags::RELU, 0.0),
            (DispatchFlags::SILU, -0.238_405_84),
            (DispatchFlags::SIGMOID, 0.119_202_92),
            (DispatchFlags::empty(), -2.0),
        ] {
            let mut dst = TensorDesc::on(g.create_buffer(4));
            g.dispatch(Operation::BatchMad, &mut dst, &[input, one, zero], flags)
                .unwrap();
            assert_eq!(dst.dims(), [1, 1, 1, 1]);
            assert_close(&g.read(&dst).unwrap(), &[expected], 1e-6);
        }
    }

    #[test]
    fn test_rejected_dispatch_leaves_no_trace() {
        let mut g = graph();
        let input = tensor(&mut g, [8, 8, 1, 1], &[1.0; 64]);
        let weight = tensor(&mut g, [3, 3, 1, 4], &[1.0; 36]);
        let small = TensorDesc::on(g.create_buffer(16));

        let mut dst = small;
        let err = g.dispatch(Operation::Conv, &mut dst, &[input, weight], DispatchFlags::empty());
        assert!(matches!(err, Err(Error::Configuration(_))));
        assert_eq!(g.dispatch_count(), 0);
        assert_eq!(dst, small);

        let mut dst = output(&mut g);
        g.dispatch(Operation::Conv, &mut dst, &[input, weight], DispatchFlags::empty())
            .unwrap();
        assert_eq!(g.dispatch_count(), 1);
    }

    #[test]
    fn test_quantize_rounds_through_half() {
        let mut g = graph();
        let values = [1.0001, -3.14159, 70000.0, -1e6, 0.0];
        let t = tensor(&mut g, [5, 1, 1, 1], &values);
        g.quantize(&t).unwrap();

        let expected: Vec<f32> = values
            .iter()
            .map(|&v| f16::from_f32(v.clamp(-65504.0, 65504.0)).to_f32())
            .collect();
        assert_eq!(g.read(&t).unwrap(), expected);
        assert_eq!(g.read(&t).unwrap()[2], 65504.0);
    }

    #[test]
    fn test_f16_operands() {
        let mut g = CpuGraph::new(EngineConfig::default().with_f16(true)).unwrap();
        let weights: Vec<f16> = [0.5f32, -1.0, 2.0, 0.25, 1.5].iter().map(|&v| f16::from_f32(v)).collect();
        let blob = g.create_buffer_bytes(bytemuck::cast_slice(&weights));

        let input = tensor(&mut g, [2, 1, 2, 1], &[1.0, 2.0, 3.0, 4.0]);
        // Odd element offset: the multiplier starts in the high half of word 0
        let mul = TensorDesc::with_size(blob, 2, 1, 1, 1)
            .with_format(Format::F16)
            .with_offset(2);
        let add = TensorDesc::with_size(blob, 2, 1, 1, 1)
            .with_format(Format::F16)
            .with_offset(6);

        assert_eq!(g.read(&mul).unwrap(), vec![-1.0, 2.0]);

        let mut dst = output(&mut g);
        g.dispatch(Operation::BatchMad, &mut dst, &[input, mul, add], DispatchFlags::empty())
            .unwrap();
        assert_eq!(g.read(&dst).unwrap(), vec![-0.75, -1.75, 7.5, 9.5]);
    }

    #[test]
    fn test_image_tiles_round_trip() {
        let mut g = CpuGraph::new(EngineConfig::default().with_image_format(ImageFormat::Rgba32Float)).unwrap();
        let extent = ImageExtent::new(6, 4);
        let pixels: Pixels = (0..24)
            .map(|i| {
                let v = i as f32 / 24.0;
                [v, 1.0 - v, v * 0.5, 1.0]
            })
            .collect();

        // 3x2 tiles of 2x2 pixels
        let tiles = TensorDesc::on(g.create_buffer(6 * 2 * 2 * 3 * 4)).with_shape(2, 2, 3, 6);
        g.image_to_tensor(&tiles, extent, &pixels).unwrap();

        let values = g.read(&tiles).unwrap();
        // Tile 4 is the second tile of the second tile row: pixel (2, 2)
        assert_eq!(values[tiles.index(0, 0, 1, 4)], pixels[2 * 6 + 2][1]);

        let back = g.tensor_to_image(extent, &tiles).unwrap();
        for (got, want) in back.iter().zip(&pixels) {
            assert_eq!(got, want);
        }
        assert_eq!(g.dispatch_count(), 2);
    }

    #[test]
    fn test_gray_tensor_to_unorm_image() {
        let mut g = graph();
        let extent = ImageExtent::new(2, 1);
        let gray = tensor(&mut g, [1, 1, 1, 2], &[0.5, 1.5]);
        let pixels = g.tensor_to_image(extent, &gray).unwrap();
        let half = (0.5f32 * 255.0).round() / 255.0;
        assert_eq!(pixels[0], [half, half, half, 1.0]);
        assert_eq!(pixels[1], [1.0, 1.0, 1.0, 1.0]);
    }
}
