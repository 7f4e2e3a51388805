//! Model inspection utilities.

use anyhow::{Context, Result};
use std::fmt::Write;
use tensorgraph_model::Model;
use tensorgraph_runtime::{Network, Operand, StageOp};

/// Render a model's descriptor table.
pub fn describe_model(model: &Model) -> Result<String> {
    let mut out = String::new();
    writeln!(
        out,
        "{} tensors, {} {} weights ({} bytes)",
        model.len(),
        model.weights.len(),
        model.weights.format(),
        model.weights.size_bytes()
    )?;
    for (index, entry) in model.entries.iter().enumerate() {
        let desc = &entry.desc;
        writeln!(
            out,
            "  {index:>3}  {:<32} rank {}  {}x{}x{}x{}  offset {}",
            entry.name, entry.rank, desc.width, desc.height, desc.depth, desc.layers, desc.offset
        )?;
    }
    Ok(out)
}

/// Check that every weight a network's stages refer to exists in `model`.
pub fn check_network(model: &Model, network: &Network) -> Result<()> {
    for stage in &network.stages {
        for operand in &stage.operands {
            if let Operand::Weight(index) = operand {
                model.entries.get(*index).with_context(|| {
                    format!(
                        "{} stage '{}' needs tensor {index}, model has {}",
                        network.name,
                        stage.name,
                        model.len()
                    )
                })?;
            }
        }
    }
    Ok(())
}

/// Render a network's stage list, resolving weight operands against `model`.
pub fn describe_network(model: &Model, network: &Network) -> Result<String> {
    let mut out = String::new();
    writeln!(
        out,
        "{}: {} stages over {}x{} tiles with {} channel(s)",
        network.name,
        network.stages.len(),
        network.tile,
        network.tile,
        network.channels
    )?;
    for stage in &network.stages {
        let op = match stage.op {
            StageOp::Operator(operation) => operation.to_string(),
            StageOp::Quantize => "quantize".to_string(),
        };
        let operands: Vec<String> = stage
            .operands
            .iter()
            .map(|operand| match operand {
                Operand::Activation => "x".to_string(),
                Operand::Flattened => "flat(x)".to_string(),
                Operand::Weight(index) => model
                    .entries
                    .get(*index)
                    .map_or_else(|| format!("#{index}?"), |e| e.name.clone()),
            })
            .collect();
        writeln!(
            out,
            "  {:<12} {:<10} stride {} pad {}  {:?}  ({})",
            stage.name,
            op,
            stage.stride,
            stage.padding,
            stage.flags,
            operands.join(", ")
        )?;
    }
    Ok(out)
}
