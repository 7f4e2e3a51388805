//! The graph dispatcher.
//!
//! `TensorGraph` owns the device buffers a session works on and records one
//! compute pass per operator. Every call is planned by
//! [`tensorgraph_operators::plan`] first, so a call that would read or write
//! outside a bound buffer fails before anything reaches the encoder.

use crate::error::{Result, RuntimeError};
use crate::image::{self, Image};
use std::collections::HashMap;
use std::sync::Arc;
use tensorgraph_core::{BufferId, DispatchFlags, Error, Format, TensorDesc};
use tensorgraph_model::Model;
use tensorgraph_operators::plan::{self, BufferTable, KernelCall};
use tensorgraph_operators::{
    BindingKind, EngineConfig, ImageExtent, ImageFormat, Kernel, Operation, compile_kernel,
};
use tracing::{debug, info};
use wgpu::util::DeviceExt;

/// Engine settings fixed at graph creation.
pub type GraphConfig = EngineConfig;

/// A compiled compute pipeline and its bind group layout.
struct CachedPipeline {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

/// Dispatches operators on a wgpu device.
///
/// Buffers are addressed through [`BufferId`] handles issued by
/// [`create_buffer`](Self::create_buffer); tensor descriptors borrow them.
pub struct TensorGraph {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    config: GraphConfig,
    pipelines: HashMap<Kernel, CachedPipeline>,
    buffers: Vec<wgpu::Buffer>,
    dispatches: usize,
}

impl BufferTable for TensorGraph {
    fn capacity(&self, buffer: BufferId) -> Option<u64> {
        self.buffers.get(buffer.0 as usize).map(|b| b.size())
    }
}

impl TensorGraph {
    /// Compile every kernel for `config` and build their pipelines.
    ///
    /// The per-dimension group limit is narrowed to what the device accepts.
    pub fn new(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        config: GraphConfig,
    ) -> Result<Self> {
        config.validate()?;
        let limits = device.limits();
        if config.group_threads() > limits.max_compute_invocations_per_workgroup {
            return Err(RuntimeError::Setup(format!(
                "group size {:?} exceeds the device limit of {} invocations",
                config.group_size, limits.max_compute_invocations_per_workgroup
            )));
        }
        let config = GraphConfig {
            max_groups_per_dimension: config
                .max_groups_per_dimension
                .min(limits.max_compute_workgroups_per_dimension),
            ..config
        };

        let mut pipelines = HashMap::new();
        for kernel in Kernel::ALL {
            pipelines.insert(kernel, create_pipeline(&device, kernel, &config)?);
        }
        info!(
            kernels = pipelines.len(),
            group_size = ?config.group_size,
            allow_f16 = config.allow_f16,
            "tensor graph ready"
        );

        Ok(Self {
            device,
            queue,
            config,
            pipelines,
            buffers: Vec::new(),
            dispatches: 0,
        })
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    pub fn queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }

    /// Number of kernels recorded so far.
    pub fn dispatch_count(&self) -> usize {
        self.dispatches
    }

    /// Allocate a zeroed storage buffer of at least `size` bytes.
    pub fn create_buffer(&mut self, size: u64) -> Result<BufferId> {
        let buffer = self.allocate(size)?;
        self.buffers.push(buffer);
        Ok(BufferId(self.buffers.len() as u32 - 1))
    }

    /// Allocate a storage buffer holding `bytes`, zero-padded to a word.
    pub fn create_buffer_init(&mut self, bytes: &[u8]) -> Result<BufferId> {
        let size = (bytes.len() as u64).max(4).next_multiple_of(4);
        self.check_size(size)?;
        let mut contents = bytes.to_vec();
        contents.resize(size as usize, 0);
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("tensor_buffer"),
                contents: &contents,
                usage: storage_usage(),
            });
        self.buffers.push(buffer);
        Ok(BufferId(self.buffers.len() as u32 - 1))
    }

    /// Replace `buffer` with a fresh zeroed allocation of `size` bytes.
    ///
    /// Descriptors keep pointing at the handle. The caller drains in-flight
    /// work first.
    pub fn resize_buffer(&mut self, buffer: BufferId, size: u64) -> Result<()> {
        let replacement = self.allocate(size)?;
        let slot = self
            .buffers
            .get_mut(buffer.0 as usize)
            .ok_or_else(|| Error::configuration(format!("unknown {buffer}")))?;
        *slot = replacement;
        debug!(%buffer, size, "resized buffer");
        Ok(())
    }

    /// Upload a model's weight blob; returns the buffer and every descriptor
    /// bound to it.
    pub fn upload_model(&mut self, model: &Model) -> Result<(BufferId, Vec<TensorDesc>)> {
        model.validate()?;
        let buffer = self.create_buffer_init(&model.weights.to_bytes())?;
        info!(
            tensors = model.len(),
            bytes = model.weights.size_bytes(),
            format = %model.weights.format(),
            "uploaded model weights"
        );
        Ok((buffer, model.bind(buffer)))
    }

    /// Overwrite the elements of an f32 `tensor`.
    pub fn write(&self, tensor: &TensorDesc, values: &[f32]) -> Result<()> {
        if tensor.format != Format::F32 {
            return Err(Error::Format(format!("host writes are f32 only, got {tensor}")).into());
        }
        if values.len() as u64 != tensor.elements() {
            return Err(Error::configuration(format!(
                "{tensor} holds {} elements, got {}",
                tensor.elements(),
                values.len()
            ))
            .into());
        }
        let buffer = self.bound(tensor)?;
        self.queue
            .write_buffer(buffer, tensor.offset, bytemuck::cast_slice(values));
        Ok(())
    }

    /// Read `size` bytes of `buffer` starting at `offset`.
    ///
    /// Both must be multiples of 4. Waits for all submitted work.
    pub fn read_buffer(&self, buffer: BufferId, offset: u64, size: u64) -> Result<Vec<u8>> {
        let source = self.buffer(buffer)?;
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 || size % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(Error::configuration(format!(
                "readback of {size} bytes at {offset} is not word aligned"
            ))
            .into());
        }
        if offset + size > source.size() {
            return Err(Error::configuration(format!(
                "readback of {size} bytes at {offset} exceeds {buffer} ({} bytes)",
                source.size()
            ))
            .into());
        }
        if size == 0 {
            return Ok(Vec::new());
        }

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("download_staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.encoder("download_copy");
        encoder.copy_buffer_to_buffer(source, offset, &staging, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));

        self.map_staging(&staging)
    }

    /// Elements of `tensor` widened to f32.
    pub fn read(&self, tensor: &TensorDesc) -> Result<Vec<f32>> {
        let buffer = tensor
            .buffer
            .ok_or_else(|| Error::configuration(format!("{tensor} is not bound to a buffer")))?;
        tensor.check_fits(self.buffer(buffer)?.size())?;

        let start = tensor.offset - tensor.offset % 4;
        let end = tensor.end().next_multiple_of(4);
        let bytes = self.read_buffer(buffer, start, end - start)?;
        let data = &bytes[(tensor.offset - start) as usize..][..tensor.bytes() as usize];
        Ok(match tensor.format {
            Format::F32 => data
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            Format::F16 => data
                .chunks_exact(2)
                .map(|b| half::f16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect(),
        })
    }

    /// Record one operator. `dst` receives the output shape.
    ///
    /// Nothing is recorded if validation fails; `dst` is only updated on
    /// success.
    pub fn dispatch(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        operation: Operation,
        dst: &mut TensorDesc,
        sources: &[TensorDesc],
        flags: DispatchFlags,
    ) -> Result<()> {
        let call = plan::plan_operation(operation, dst, sources, flags, &*self, &self.config)?;
        self.record(encoder, &call, None)?;
        *dst = call.output;
        Ok(())
    }

    /// Record an in-place binary16 round trip of `tensor`.
    pub fn quantize(&mut self, encoder: &mut wgpu::CommandEncoder, tensor: &TensorDesc) -> Result<()> {
        let call = plan::plan_quantize(tensor, &*self, &self.config)?;
        self.record(encoder, &call, None)
    }

    /// Record the split of `image` into the tiles of `dst`.
    pub fn image_to_tensor(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        dst: &TensorDesc,
        image: &wgpu::Texture,
    ) -> Result<()> {
        let sampled = matches!(
            image.format().sample_type(None, None),
            Some(wgpu::TextureSampleType::Float { .. })
        );
        if !sampled || !image.usage().contains(wgpu::TextureUsages::TEXTURE_BINDING) {
            return Err(Error::configuration(format!(
                "image_to_tensor needs a float-sampled texture, got {:?}",
                image.format()
            ))
            .into());
        }
        let extent = ImageExtent::new(image.width(), image.height());
        let call = plan::plan_image_to_tensor(dst, extent, &*self, &self.config)?;
        let view = image.create_view(&wgpu::TextureViewDescriptor::default());
        self.record(encoder, &call, Some(&view))
    }

    /// Record the assembly of `src` layers into `image` tiles.
    pub fn tensor_to_image(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        image: &wgpu::Texture,
        src: &TensorDesc,
    ) -> Result<()> {
        let expected = image::texture_format(self.config.image_format);
        if image.format() != expected
            || !image.usage().contains(wgpu::TextureUsages::STORAGE_BINDING)
        {
            return Err(Error::configuration(format!(
                "tensor_to_image writes {expected:?} storage textures, got {:?}",
                image.format()
            ))
            .into());
        }
        let extent = ImageExtent::new(image.width(), image.height());
        let call = plan::plan_tensor_to_image(extent, src, &*self, &self.config)?;
        let view = image.create_view(&wgpu::TextureViewDescriptor::default());
        self.record(encoder, &call, Some(&view))
    }

    /// A texture the conversion kernels can read, in the configured format.
    pub fn create_source_texture(&self, extent: ImageExtent) -> Result<wgpu::Texture> {
        image::create_texture(
            &self.device,
            "source_image",
            extent,
            self.config.image_format,
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        )
    }

    /// A texture the conversion kernels can write, in the configured format.
    pub fn create_surface_texture(&self, extent: ImageExtent) -> Result<wgpu::Texture> {
        image::create_texture(
            &self.device,
            "surface_image",
            extent,
            self.config.image_format,
            wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
        )
    }

    /// Upload `image` into a texture of the same size.
    pub fn write_image(&self, texture: &wgpu::Texture, image: &Image) -> Result<()> {
        image.validate()?;
        let format = texture_image_format(texture)?;
        if (texture.width(), texture.height()) != (image.width, image.height) {
            return Err(Error::configuration(format!(
                "{}x{} image does not match {}x{} texture",
                image.width,
                image.height,
                texture.width(),
                texture.height()
            ))
            .into());
        }
        self.queue.write_texture(
            texture.as_image_copy(),
            &image.to_bytes(format),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(image.width * format.pixel_size()),
                rows_per_image: None,
            },
            texture.size(),
        );
        Ok(())
    }

    /// Read a texture back. Waits for all submitted work.
    pub fn read_image(&self, texture: &wgpu::Texture) -> Result<Image> {
        let format = texture_image_format(texture)?;
        let (width, height) = (texture.width(), texture.height());
        let row = width * format.pixel_size();
        let padded_row = image::padded_row_bytes(width, format);

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("image_staging"),
            size: padded_row as u64 * height as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.encoder("image_copy");
        encoder.copy_texture_to_buffer(
            texture.as_image_copy(),
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: None,
                },
            },
            texture.size(),
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let padded = self.map_staging(&staging)?;
        let bytes: Vec<u8> = padded
            .chunks_exact(padded_row as usize)
            .flat_map(|line| &line[..row as usize])
            .copied()
            .collect();
        Image::from_bytes(width, height, format, &bytes)
    }

    pub fn encoder(&self, label: &str) -> wgpu::CommandEncoder {
        self.device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }

    /// Submit recorded work.
    pub fn submit(&self, encoder: wgpu::CommandEncoder) -> wgpu::SubmissionIndex {
        self.queue.submit(std::iter::once(encoder.finish()))
    }

    /// Block until every submitted command has finished.
    pub fn wait(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|e| RuntimeError::Device(format!("GPU poll failed: {e:?}")))?;
        Ok(())
    }

    fn record(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        call: &KernelCall,
        texture: Option<&wgpu::TextureView>,
    ) -> Result<()> {
        let cached = self.pipelines.get(&call.kernel).ok_or_else(|| {
            RuntimeError::Setup(format!("kernel {} has no pipeline", call.kernel))
        })?;

        let params = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("kernel_params"),
                contents: call.params.as_bytes(),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let mut storage = call.buffers.iter();
        let mut entries = Vec::with_capacity(call.kernel.bindings().len());
        for (binding, kind) in call.kernel.bindings().iter().enumerate() {
            let resource = match kind {
                BindingKind::Uniform => params.as_entire_binding(),
                BindingKind::StorageRead | BindingKind::StorageReadWrite => {
                    let buffer = storage.next().ok_or_else(|| {
                        Error::configuration(format!("{} is missing a buffer", call.kernel))
                    })?;
                    self.buffer(*buffer)?.as_entire_binding()
                }
                BindingKind::Texture | BindingKind::StorageTexture => {
                    let view = texture.ok_or_else(|| {
                        Error::configuration(format!("{} is missing a texture", call.kernel))
                    })?;
                    wgpu::BindingResource::TextureView(view)
                }
            };
            entries.push(wgpu::BindGroupEntry {
                binding: binding as u32,
                resource,
            });
        }

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(call.kernel.label()),
            layout: &cached.bind_group_layout,
            entries: &entries,
        });

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(call.kernel.label()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&cached.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            let [x, y, z] = call.workgroups;
            pass.dispatch_workgroups(x, y, z);
        }

        debug!(
            kernel = %call.kernel,
            output = %call.output,
            workgroups = ?call.workgroups,
            "dispatch"
        );
        self.dispatches += 1;
        Ok(())
    }

    fn map_staging(&self, staging: &wgpu::Buffer) -> Result<Vec<u8>> {
        let slice = staging.slice(..);
        let (sender, receiver) = futures::channel::oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.wait()?;
        pollster::block_on(receiver)
            .map_err(|_| RuntimeError::Device("buffer map callback was dropped".to_string()))??;

        let data = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(data)
    }

    fn buffer(&self, buffer: BufferId) -> Result<&wgpu::Buffer> {
        self.buffers
            .get(buffer.0 as usize)
            .ok_or_else(|| Error::configuration(format!("unknown {buffer}")).into())
    }

    fn bound(&self, tensor: &TensorDesc) -> Result<&wgpu::Buffer> {
        let id = tensor
            .buffer
            .ok_or_else(|| Error::configuration(format!("{tensor} is not bound to a buffer")))?;
        let buffer = self.buffer(id)?;
        tensor.check_fits(buffer.size())?;
        Ok(buffer)
    }

    /// Fail with `Allocation` if a `size`-byte storage buffer exceeds the
    /// device limits.
    pub fn check_size(&self, size: u64) -> Result<()> {
        let limits = self.device.limits();
        let max = limits
            .max_buffer_size
            .min(limits.max_storage_buffer_binding_size as u64);
        if size > max {
            return Err(RuntimeError::Allocation(format!(
                "{size}-byte buffer exceeds the device limit of {max} bytes"
            )));
        }
        Ok(())
    }

    fn allocate(&self, size: u64) -> Result<wgpu::Buffer> {
        let size = size.max(4).next_multiple_of(4);
        self.check_size(size)?;
        Ok(self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("tensor_buffer"),
            size,
            usage: storage_usage(),
            mapped_at_creation: false,
        }))
    }
}

fn storage_usage() -> wgpu::BufferUsages {
    wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST
}

fn texture_image_format(texture: &wgpu::Texture) -> Result<ImageFormat> {
    image::image_format(texture.format()).ok_or_else(|| {
        Error::Format(format!("{:?} textures cannot be copied to host images", texture.format()))
            .into()
    })
}

fn create_pipeline(
    device: &wgpu::Device,
    kernel: Kernel,
    config: &GraphConfig,
) -> Result<CachedPipeline> {
    let compiled = compile_kernel(kernel, config)?;
    let label = compiled.label.as_str();

    let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(std::borrow::Cow::Owned(compiled.wgsl.clone())),
    });

    let entries: Vec<wgpu::BindGroupLayoutEntry> = kernel
        .bindings()
        .iter()
        .enumerate()
        .map(|(binding, kind)| wgpu::BindGroupLayoutEntry {
            binding: binding as u32,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: binding_type(*kind, config.image_format),
            count: None,
        })
        .collect();

    let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(&format!("{label}_layout")),
        entries: &entries,
    });

    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(&format!("{label}_pipeline_layout")),
        bind_group_layouts: &[&bind_group_layout],
        push_constant_ranges: &[],
    });

    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        module: &shader_module,
        entry_point: Some("main"),
        compilation_options: Default::default(),
        cache: None,
    });

    Ok(CachedPipeline {
        pipeline,
        bind_group_layout,
    })
}

fn binding_type(kind: BindingKind, format: ImageFormat) -> wgpu::BindingType {
    match kind {
        BindingKind::Uniform => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        BindingKind::StorageRead | BindingKind::StorageReadWrite => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage {
                read_only: kind == BindingKind::StorageRead,
            },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        BindingKind::Texture => wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        BindingKind::StorageTexture => wgpu::BindingType::StorageTexture {
            access: wgpu::StorageTextureAccess::WriteOnly,
            format: image::texture_format(format),
            view_dimension: wgpu::TextureViewDimension::D2,
        },
    }
}
