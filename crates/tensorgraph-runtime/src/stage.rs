//! Fixed stage lists and the ping-pong runner.
//!
//! A network is a plain list of [`Stage`]s. [`run_stages`] walks it once per
//! frame, feeding each stage the previous stage's output and alternating the
//! two scratch buffers explicitly through [`Slot`]. The same walk drives the
//! device ([`Recorder`]), the host reference ([`CpuGraph`]) and the scratch
//! sizing dry run ([`ScratchSizer`]).

use crate::error::{Result, RuntimeError};
use crate::graph::{GraphConfig, TensorGraph};
use tensorgraph_core::{Activation, BufferId, DispatchFlags, Error, TensorDesc};
use tensorgraph_operators::plan::{self, BufferTable};
use tensorgraph_operators::{CpuGraph, Operation};

/// What a stage computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOp {
    Operator(Operation),
    /// In-place binary16 round trip of the current activation.
    Quantize,
}

/// Where an operand comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// The previous stage's output, with the stage's stride and padding.
    Activation,
    /// The previous stage's output viewed as one column vector per layer.
    Flattened,
    /// A model tensor by index.
    Weight(usize),
}

/// Where a stage writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Target {
    /// The scratch slot after the one holding the current activation.
    #[default]
    Scratch,
    /// The session's input/output tensor, with its preset shape.
    Output,
}

/// One operator invocation of a fixed network.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub name: String,
    pub op: StageOp,
    pub operands: Vec<Operand>,
    /// Applied to [`Operand::Activation`].
    pub stride: u32,
    /// Applied to [`Operand::Activation`].
    pub padding: u32,
    pub flags: DispatchFlags,
    pub target: Target,
    /// Extra bottom/right rows of a DeConv writing into [`Target::Output`].
    pub output_padding: u32,
}

impl Stage {
    pub fn operator(operation: Operation, operands: Vec<Operand>) -> Self {
        Self {
            name: operation.name().to_string(),
            op: StageOp::Operator(operation),
            operands,
            stride: 1,
            padding: 0,
            flags: DispatchFlags::empty(),
            target: Target::Scratch,
            output_padding: 0,
        }
    }

    pub fn conv(weight: usize) -> Self {
        Self::operator(Operation::Conv, vec![Operand::Activation, Operand::Weight(weight)])
    }

    pub fn deconv(weight: usize) -> Self {
        Self::operator(Operation::DeConv, vec![Operand::Activation, Operand::Weight(weight)])
    }

    pub fn max_pool(stride: u32) -> Self {
        Self::operator(Operation::MaxPool, vec![Operand::Activation]).window(stride, 0)
    }

    pub fn batch_norm(mean: usize, variance: usize) -> Self {
        Self::operator(
            Operation::BatchNorm,
            vec![Operand::Activation, Operand::Weight(mean), Operand::Weight(variance)],
        )
    }

    pub fn batch_mad(multiplier: usize, addend: usize) -> Self {
        Self::operator(
            Operation::BatchMad,
            vec![Operand::Activation, Operand::Weight(multiplier), Operand::Weight(addend)],
        )
    }

    /// `weight · flatten(activation) + bias`.
    pub fn mat_mad(weight: usize, bias: usize) -> Self {
        Self::operator(
            Operation::MatMad,
            vec![Operand::Weight(weight), Operand::Flattened, Operand::Weight(bias)],
        )
    }

    pub fn quantize() -> Self {
        Self {
            name: "quantize".to_string(),
            op: StageOp::Quantize,
            operands: vec![Operand::Activation],
            stride: 1,
            padding: 0,
            flags: DispatchFlags::empty(),
            target: Target::Scratch,
            output_padding: 0,
        }
    }

    /// Append a bias operand.
    pub fn bias(mut self, bias: usize) -> Self {
        self.operands.push(Operand::Weight(bias));
        self
    }

    pub fn window(self, stride: u32, padding: u32) -> Self {
        Self {
            stride,
            padding,
            ..self
        }
    }

    pub fn activation(self, activation: Activation) -> Self {
        Self {
            flags: (self.flags - DispatchFlags::ACTIVATIONS) | DispatchFlags::from(activation),
            ..self
        }
    }

    pub fn flags(self, flags: DispatchFlags) -> Self {
        Self { flags, ..self }
    }

    /// Write into the output tensor instead of a scratch slot.
    pub fn into_output(self, output_padding: u32) -> Self {
        Self {
            target: Target::Output,
            output_padding,
            ..self
        }
    }

    pub fn named(self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self
        }
    }
}

/// Which of the two scratch buffers a stage writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Slot {
    #[default]
    First,
    Second,
}

impl Slot {
    pub fn index(self) -> usize {
        match self {
            Slot::First => 0,
            Slot::Second => 1,
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            Slot::First => Slot::Second,
            Slot::Second => Slot::First,
        }
    }
}

/// Something that can execute the stages of a network.
pub trait StageExecutor {
    fn operator(
        &mut self,
        operation: Operation,
        dst: &mut TensorDesc,
        sources: &[TensorDesc],
        flags: DispatchFlags,
    ) -> Result<()>;

    fn quantize(&mut self, tensor: &TensorDesc) -> Result<()>;
}

/// Buffers a stage walk reads and writes.
#[derive(Debug, Clone, Copy)]
pub struct StageBuffers<'a> {
    /// First activation.
    pub input: TensorDesc,
    /// Destination of [`Target::Output`] stages.
    pub output: TensorDesc,
    pub weights: &'a [TensorDesc],
    pub scratch: [BufferId; 2],
}

/// Run `stages` once, returning the final activation.
pub fn run_stages<E: StageExecutor>(
    stages: &[Stage],
    buffers: StageBuffers<'_>,
    executor: &mut E,
) -> Result<TensorDesc> {
    let mut current = buffers.input;
    let mut slot = Slot::First;

    for stage in stages {
        let operation = match stage.op {
            StageOp::Quantize => {
                executor.quantize(&current)?;
                continue;
            }
            StageOp::Operator(operation) => operation,
        };

        let sources = stage
            .operands
            .iter()
            .map(|operand| match *operand {
                Operand::Activation => Ok(current.with_stride(stage.stride).with_padding(stage.padding)),
                Operand::Flattened => current.flattened().map_err(RuntimeError::from),
                Operand::Weight(index) => buffers.weights.get(index).copied().ok_or_else(|| {
                    RuntimeError::from(Error::configuration(format!(
                        "stage '{}' uses tensor {index} but the model has {}",
                        stage.name,
                        buffers.weights.len()
                    )))
                }),
            })
            .collect::<Result<Vec<_>>>()?;

        let mut dst = match stage.target {
            Target::Scratch => TensorDesc::on(buffers.scratch[slot.index()]),
            Target::Output => buffers.output.with_padding(stage.output_padding),
        };
        executor
            .operator(operation, &mut dst, &sources, stage.flags)
            .map_err(|e| stage_error(stage, e))?;

        current = dst;
        if stage.target == Target::Scratch {
            slot = slot.toggled();
        }
    }

    Ok(current)
}

fn stage_error(stage: &Stage, error: RuntimeError) -> RuntimeError {
    match error {
        RuntimeError::Configuration(Error::Configuration(message)) => {
            RuntimeError::Configuration(Error::Configuration(format!(
                "stage '{}': {message}",
                stage.name
            )))
        }
        other => other,
    }
}

/// Records stages into a command encoder.
pub struct Recorder<'a> {
    pub graph: &'a mut TensorGraph,
    pub encoder: &'a mut wgpu::CommandEncoder,
}

impl StageExecutor for Recorder<'_> {
    fn operator(
        &mut self,
        operation: Operation,
        dst: &mut TensorDesc,
        sources: &[TensorDesc],
        flags: DispatchFlags,
    ) -> Result<()> {
        self.graph
            .dispatch(self.encoder, operation, dst, sources, flags)
    }

    fn quantize(&mut self, tensor: &TensorDesc) -> Result<()> {
        self.graph.quantize(self.encoder, tensor)
    }
}

impl StageExecutor for CpuGraph {
    fn operator(
        &mut self,
        operation: Operation,
        dst: &mut TensorDesc,
        sources: &[TensorDesc],
        flags: DispatchFlags,
    ) -> Result<()> {
        Ok(self.dispatch(operation, dst, sources, flags)?)
    }

    fn quantize(&mut self, tensor: &TensorDesc) -> Result<()> {
        Ok(CpuGraph::quantize(self, tensor)?)
    }
}

/// Plans every stage against unbounded buffers to find the largest
/// intermediate written to scratch.
///
/// Shape, operand and group-limit errors surface here, before any buffer is
/// allocated.
#[derive(Debug, Clone)]
pub struct ScratchSizer {
    config: GraphConfig,
    scratch: [BufferId; 2],
    largest: u64,
}

impl ScratchSizer {
    pub fn new(config: GraphConfig, scratch: [BufferId; 2]) -> Self {
        Self {
            config,
            scratch,
            largest: 0,
        }
    }

    /// Bytes each scratch buffer needs.
    pub fn required(&self) -> u64 {
        self.largest
    }
}

impl BufferTable for ScratchSizer {
    fn capacity(&self, _buffer: BufferId) -> Option<u64> {
        Some(u64::MAX)
    }
}

impl StageExecutor for ScratchSizer {
    fn operator(
        &mut self,
        operation: Operation,
        dst: &mut TensorDesc,
        sources: &[TensorDesc],
        flags: DispatchFlags,
    ) -> Result<()> {
        let call = plan::plan_operation(operation, dst, sources, flags, &*self, &self.config)?;
        if call.output.buffer.is_some_and(|b| self.scratch.contains(&b)) {
            self.largest = self.largest.max(call.output.end());
        }
        *dst = call.output;
        Ok(())
    }

    fn quantize(&mut self, tensor: &TensorDesc) -> Result<()> {
        plan::plan_quantize(tensor, &*self, &self.config)?;
        Ok(())
    }
}
