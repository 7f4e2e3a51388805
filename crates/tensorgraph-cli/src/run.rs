//! Frame loop for the built-in networks.
//!
//! Feeds a generated test pattern through a session for a number of frames
//! and collects timing plus a summary of the last frame's output.

use anyhow::{Context, Result};
use std::time::Duration;
use tensorgraph_model::Model;
use tensorgraph_runtime::{
    GraphConfig, Image, ImageFormat, NetworkOutput, Runtime, Session, SessionConfig,
};
use tracing::info;

use crate::NetworkKind;

/// Settings of one `run` invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub network: NetworkKind,
    pub width: u32,
    pub height: u32,
    pub frames: u32,
    /// Overrides the network's tile edge.
    pub tile: Option<u32>,
    /// Upload the weights as binary16.
    pub f16: bool,
}

/// Statistics from a run.
#[derive(Debug)]
pub struct RunStats {
    pub frames: u64,
    /// Kernels dispatched per frame.
    pub dispatches: usize,
    /// Slowest single frame.
    pub slowest: Duration,
    pub total: Duration,
    /// Bytes held by each scratch buffer.
    pub scratch_bytes: u64,
    /// Winning class per tile, for logit networks.
    pub classes: Option<Vec<usize>>,
    /// Last presented frame, for image networks.
    pub image: Option<Image>,
}

impl RunStats {
    /// Mean frame time.
    pub fn mean(&self) -> Duration {
        if self.frames == 0 {
            return Duration::ZERO;
        }
        self.total / self.frames as u32
    }
}

/// A noisy diagonal gradient, so both networks see non-trivial input.
pub fn test_pattern(width: u32, height: u32) -> Image {
    Image::from_fn(width, height, |x, y| {
        let u = x as f32 / width.max(1) as f32;
        let v = y as f32 / height.max(1) as f32;
        // Cheap deterministic hash noise in [-0.05, 0.05]
        let hash = (x.wrapping_mul(73_856_093) ^ y.wrapping_mul(19_349_663)) % 1000;
        let noise = hash as f32 / 10_000.0 - 0.05;
        [
            (u + noise).clamp(0.0, 1.0),
            (v + noise).clamp(0.0, 1.0),
            ((u + v) * 0.5 + noise).clamp(0.0, 1.0),
            1.0,
        ]
    })
}

/// Run `options.frames` frames of a built-in network over the test pattern.
pub fn run_frames(runtime: &Runtime, model: &Model, options: &RunOptions) -> Result<RunStats> {
    let network = options.network.network();
    let output = network.output;
    let model = if options.f16 {
        model.to_f16()
    } else {
        model.clone()
    };

    let graph = runtime
        .graph(GraphConfig::default().with_f16(options.f16))
        .context("Failed to create tensor graph")?;
    let mut config = SessionConfig::new(network);
    if let Some(tile) = options.tile {
        config = config.with_tile(tile);
    }
    let mut session = Session::new(graph, &model, config).context("Failed to create session")?;

    let input = test_pattern(options.width, options.height);
    session
        .set_input(&input)
        .with_context(|| format!("Failed to set {}x{} input", options.width, options.height))?;

    let mut stats = RunStats {
        frames: 0,
        dispatches: 0,
        slowest: Duration::ZERO,
        total: Duration::ZERO,
        scratch_bytes: session.scratch_capacity(),
        classes: None,
        image: None,
    };
    for _ in 0..options.frames {
        let report = session
            .advance()
            .with_context(|| format!("Frame {} failed", stats.frames + 1))?;
        info!(frame = report.frame, elapsed = ?report.elapsed, "frame done");
        stats.frames = report.frame;
        stats.dispatches = report.dispatches;
        stats.slowest = stats.slowest.max(report.elapsed);
        stats.total += report.elapsed;
    }

    if stats.frames > 0 {
        match output {
            NetworkOutput::Logits => stats.classes = Some(session.classify()?),
            NetworkOutput::Image => stats.image = Some(session.read_output_image()?),
        }
    }
    Ok(stats)
}

/// Mean and range of every channel of `image`.
pub fn channel_stats(image: &Image) -> [(f32, f32, f32); 4] {
    let mut stats = [(0.0, f32::INFINITY, f32::NEG_INFINITY); 4];
    for pixel in &image.pixels {
        for (channel, &value) in stats.iter_mut().zip(pixel) {
            channel.0 += value;
            channel.1 = channel.1.min(value);
            channel.2 = channel.2.max(value);
        }
    }
    let count = image.pixels.len().max(1) as f32;
    stats.map(|(sum, min, max)| (sum / count, min, max))
}

/// Write `image` as raw RGBA8 bytes.
pub fn save_raw(image: &Image, path: &std::path::Path) -> Result<()> {
    std::fs::write(path, image.to_bytes(ImageFormat::Rgba8Unorm))
        .with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_stays_in_range() {
        let image = test_pattern(40, 30);
        assert_eq!(image.pixels.len(), 1200);
        assert!(image.pixels.iter().flatten().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(image.pixel(0, 0).map(|p| p[3]), Some(1.0));
    }

    #[test]
    fn test_channel_stats() {
        let image = Image::from_fn(2, 1, |x, _| [x as f32, 0.5, 0.0, 1.0]);
        let [r, g, _, a] = channel_stats(&image);
        assert_eq!(r, (0.5, 0.0, 1.0));
        assert_eq!(g, (0.5, 0.5, 0.5));
        assert_eq!(a, (1.0, 1.0, 1.0));
    }

    #[test]
    fn test_mean_frame_time() {
        let stats = RunStats {
            frames: 4,
            dispatches: 0,
            slowest: Duration::ZERO,
            total: Duration::from_millis(10),
            scratch_bytes: 0,
            classes: None,
            image: None,
        };
        assert_eq!(stats.mean(), Duration::from_micros(2500));
    }
}
