//! Per-frame execution of a fixed network.
//!
//! A session owns everything one network needs on the device: the weight
//! buffer, the input/output tensor, two scratch buffers and the source and
//! surface textures. Each [`Session::advance`] runs one cycle:
//!
//! ```text
//! Idle -> Converting (image -> tensor) -> Running (stages)
//!      -> Converting (tensor -> image) -> Presented -> Idle
//! ```
//!
//! Each phase is submitted separately, so the image load is complete before
//! the first stage reads the tensor and the last stage is complete before
//! the surface is written. Logit networks skip the final conversion.

use crate::error::{Result, RuntimeError};
use crate::graph::TensorGraph;
use crate::image::Image;
use crate::networks::{Network, NetworkOutput};
use crate::stage::{Recorder, ScratchSizer, StageBuffers, Target, run_stages};
use std::time::{Duration, Instant};
use tensorgraph_core::{BufferId, Error, TensorDesc};
use tensorgraph_model::Model;
use tensorgraph_operators::ImageExtent;
use tracing::{debug, info, instrument, warn};

/// Session settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub network: Network,
    /// Tile edge; defaults to the network's.
    pub tile: u32,
    /// Extra bytes added to each scratch buffer beyond the largest
    /// intermediate.
    pub scratch_slack: u64,
}

impl SessionConfig {
    pub fn new(network: Network) -> Self {
        Self {
            tile: network.tile,
            network,
            scratch_slack: 0,
        }
    }

    pub fn with_tile(self, tile: u32) -> Self {
        Self { tile, ..self }
    }

    pub fn with_scratch_slack(self, scratch_slack: u64) -> Self {
        Self {
            scratch_slack,
            ..self
        }
    }
}

/// Where a session is in its frame cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Converting,
    Running,
    Presented,
}

/// Statistics of one [`Session::advance`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameReport {
    /// Frame number, starting at 1.
    pub frame: u64,
    /// Kernels recorded for the frame.
    pub dispatches: usize,
    /// Host time from the first record to completion.
    pub elapsed: Duration,
}

/// Resources sized for one input resolution.
struct Surfaces {
    extent: ImageExtent,
    source: wgpu::Texture,
    surface: Option<wgpu::Texture>,
}

/// Runs a fixed network once per frame.
pub struct Session {
    graph: TensorGraph,
    config: SessionConfig,
    weights: Vec<TensorDesc>,
    io: BufferId,
    scratch: [BufferId; 2],
    scratch_capacity: u64,
    input: TensorDesc,
    output: Option<TensorDesc>,
    surfaces: Option<Surfaces>,
    state: SessionState,
    frames: u64,
}

impl Session {
    /// Upload `model` and prepare the network.
    ///
    /// Buffers that depend on the input resolution are allocated by
    /// [`set_input`](Self::set_input).
    #[instrument(skip_all, fields(network = config.network.name))]
    pub fn new(mut graph: TensorGraph, model: &Model, config: SessionConfig) -> Result<Self> {
        let network = &config.network;
        if config.tile == 0 || !(1..=4).contains(&network.channels) {
            return Err(Error::configuration(format!(
                "{}: tile {} with {} channels",
                network.name, config.tile, network.channels
            ))
            .into());
        }
        let writes_output = network.stages.iter().any(|s| s.target == Target::Output);
        if (network.output == NetworkOutput::Image) != writes_output {
            return Err(Error::configuration(format!(
                "{}: image networks must end in the output tensor, logit networks must not",
                network.name
            ))
            .into());
        }

        let (_, weights) = graph.upload_model(model)?;
        let io = graph.create_buffer(4)?;
        let scratch = [graph.create_buffer(4)?, graph.create_buffer(4)?];
        info!(
            stages = network.stages.len(),
            tensors = weights.len(),
            tile = config.tile,
            "session created"
        );

        Ok(Self {
            graph,
            config,
            weights,
            io,
            scratch,
            scratch_capacity: 0,
            input: TensorDesc::default(),
            output: None,
            surfaces: None,
            state: SessionState::Idle,
            frames: 0,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn graph(&self) -> &TensorGraph {
        &self.graph
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Frames completed so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// The tiled input tensor, unshaped until an input is set.
    pub fn input_tensor(&self) -> &TensorDesc {
        &self.input
    }

    /// The last frame's final activation.
    pub fn output_tensor(&self) -> Option<&TensorDesc> {
        self.output.as_ref()
    }

    /// Bytes held by each scratch buffer.
    pub fn scratch_capacity(&self) -> u64 {
        self.scratch_capacity
    }

    /// Upload the next frame's input.
    ///
    /// A new resolution drains in-flight work, re-plans the stages and
    /// reallocates the scratch buffers, the tensor and the textures. Pixels
    /// beyond the last whole tile are ignored.
    #[instrument(skip_all, fields(width = image.width, height = image.height))]
    pub fn set_input(&mut self, image: &Image) -> Result<()> {
        let extent = image.extent();
        if self.surfaces.as_ref().map(|s| s.extent) != Some(extent) {
            self.resize(extent)?;
        }
        let surfaces = self
            .surfaces
            .as_ref()
            .ok_or_else(|| RuntimeError::Setup("input textures missing after resize".to_string()))?;
        self.graph.write_image(&surfaces.source, image)
    }

    fn resize(&mut self, extent: ImageExtent) -> Result<()> {
        let tile = self.config.tile;
        let (tiles_x, tiles_y) = extent.tiles(tile, tile);
        if tiles_x == 0 || tiles_y == 0 {
            return Err(Error::configuration(format!(
                "{}x{} image is smaller than one {tile}x{tile} tile",
                extent.width, extent.height
            ))
            .into());
        }
        if extent.width % tile != 0 || extent.height % tile != 0 {
            warn!(
                width = extent.width,
                height = extent.height,
                tile,
                "image is not a whole number of tiles, the border is dropped"
            );
        }

        let input = TensorDesc::with_size(
            self.io,
            tile,
            tile,
            self.config.network.channels,
            tiles_x * tiles_y,
        );
        let mut sizer = ScratchSizer::new(*self.graph.config(), self.scratch);
        run_stages(&self.config.network.stages, self.stage_buffers(input), &mut sizer)?;
        let capacity = sizer.required() + self.config.scratch_slack;

        // Everything that can fail happens before the old resources are released
        self.graph.check_size(input.bytes())?;
        self.graph.check_size(capacity)?;
        let source = self.graph.create_source_texture(extent)?;
        let surface = match self.config.network.output {
            NetworkOutput::Image => Some(self.graph.create_surface_texture(extent)?),
            NetworkOutput::Logits => None,
        };
        self.graph.wait()?;

        self.surfaces = None;
        self.output = None;
        self.graph.resize_buffer(self.io, input.bytes())?;
        for buffer in self.scratch {
            self.graph.resize_buffer(buffer, capacity)?;
        }

        self.input = input;
        self.scratch_capacity = capacity;
        self.surfaces = Some(Surfaces {
            extent,
            source,
            surface,
        });
        info!(
            width = extent.width,
            height = extent.height,
            tiles = tiles_x * tiles_y,
            scratch_bytes = capacity,
            "session resized"
        );
        Ok(())
    }

    fn stage_buffers(&self, input: TensorDesc) -> StageBuffers<'_> {
        StageBuffers {
            input,
            output: input,
            weights: &self.weights,
            scratch: self.scratch,
        }
    }

    /// Run one frame over the current input.
    ///
    /// The session is idle again when this returns, whether the frame was
    /// presented or failed. After a device error the caller should stop its
    /// frame loop.
    #[instrument(skip(self), fields(frame = self.frames + 1))]
    pub fn advance(&mut self) -> Result<FrameReport> {
        let result = self.run_frame();
        self.enter(SessionState::Idle);
        result
    }

    fn enter(&mut self, state: SessionState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "session state");
            self.state = state;
        }
    }

    fn run_frame(&mut self) -> Result<FrameReport> {
        let surfaces = self
            .surfaces
            .take()
            .ok_or_else(|| Error::configuration("no input set for this session"))?;
        let result = self.record_frame(&surfaces);
        self.surfaces = Some(surfaces);
        result
    }

    fn record_frame(&mut self, surfaces: &Surfaces) -> Result<FrameReport> {
        let started = Instant::now();
        let first_dispatch = self.graph.dispatch_count();

        self.enter(SessionState::Converting);
        let mut encoder = self.graph.encoder("image_to_tensor");
        self.graph
            .image_to_tensor(&mut encoder, &self.input, &surfaces.source)?;
        self.graph.submit(encoder);

        self.enter(SessionState::Running);
        let mut encoder = self.graph.encoder("stages");
        let buffers = StageBuffers {
            input: self.input,
            output: self.input,
            weights: &self.weights,
            scratch: self.scratch,
        };
        let output = run_stages(
            &self.config.network.stages,
            buffers,
            &mut Recorder {
                graph: &mut self.graph,
                encoder: &mut encoder,
            },
        )?;
        self.graph.submit(encoder);

        if let Some(surface) = &surfaces.surface {
            self.enter(SessionState::Converting);
            let mut encoder = self.graph.encoder("tensor_to_image");
            self.graph.tensor_to_image(&mut encoder, surface, &output)?;
            self.graph.submit(encoder);
        }

        self.graph.wait()?;
        self.output = Some(output);
        self.enter(SessionState::Presented);
        self.frames += 1;

        Ok(FrameReport {
            frame: self.frames,
            dispatches: self.graph.dispatch_count() - first_dispatch,
            elapsed: started.elapsed(),
        })
    }

    /// The presented image of an image network.
    pub fn read_output_image(&self) -> Result<Image> {
        let surface = self
            .surfaces
            .as_ref()
            .and_then(|s| s.surface.as_ref())
            .ok_or_else(|| {
                Error::configuration(format!("{} does not present an image", self.config.network.name))
            })?;
        if self.output.is_none() {
            return Err(Error::configuration("no frame has been presented").into());
        }
        self.graph.read_image(surface)
    }

    /// The last frame's final activation, widened to f32.
    pub fn read_output_tensor(&self) -> Result<Vec<f32>> {
        let output = self
            .output
            .as_ref()
            .ok_or_else(|| Error::configuration("no frame has been presented"))?;
        self.graph.read(output)
    }

    /// Highest-scoring class of every tile, for logit networks.
    pub fn classify(&self) -> Result<Vec<usize>> {
        let output = self
            .output
            .ok_or_else(|| Error::configuration("no frame has been presented"))?;
        if self.config.network.output != NetworkOutput::Logits {
            return Err(Error::configuration(format!(
                "{} does not produce logits",
                self.config.network.name
            ))
            .into());
        }
        let scores = self.graph.read(&output)?;
        Ok(argmax_per_layer(&scores, output.layers))
    }
}

/// Index of the largest value in each of `layers` equal chunks.
pub(crate) fn argmax_per_layer(scores: &[f32], layers: u32) -> Vec<usize> {
    if layers == 0 || scores.is_empty() {
        return Vec::new();
    }
    let per_layer = scores.len() / layers as usize;
    scores
        .chunks(per_layer.max(1))
        .take(layers as usize)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
                    if v > best.1 { (i, v) } else { best }
                })
                .0
        })
        .collect()
}
