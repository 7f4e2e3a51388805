//! Shared helpers for the GPU integration tests.

#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tensorgraph_model::{Model, ModelWriter, parse_model};
use tensorgraph_runtime::{GraphConfig, Runtime, TensorGraph};

/// Create a graph on the default adapter.
pub async fn graph(config: GraphConfig) -> TensorGraph {
    let runtime = Runtime::new().await.expect("Runtime init should succeed");
    runtime.graph(config).expect("Graph creation should succeed")
}

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

pub fn random_values(rng: &mut StdRng, len: usize, scale: f32) -> Vec<f32> {
    (0..len).map(|_| rng.random_range(-scale..scale)).collect()
}

/// Assert element-wise agreement within `tolerance` (absolute, scaled by magnitude above 1).
pub fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        let bound = tolerance * e.abs().max(1.0);
        assert!(
            (a - e).abs() <= bound,
            "element {i}: got {a}, expected {e} (tolerance {bound})"
        );
    }
}

/// Random weights laid out like a trained denoiser with `c` channels per block.
pub fn denoiser_model(c: u16) -> Model {
    let mut rng = rng(7);
    let mut writer = ModelWriter::new();
    let mut push = |name: &str, shape: &[u16], scale: f32| {
        let len = shape.iter().map(|&d| d as usize).product();
        writer
            .push(name, shape, &random_values(&mut rng, len, scale))
            .expect("valid tensor");
    };
    for (block, (inputs, k)) in [(3, 5), (c, 3), (c, 3), (c, 3)].into_iter().enumerate() {
        push(&format!("encoder.{}.weight", block * 3), &[c, inputs, k, k], 0.3);
        if block < 3 {
            let norm = block * 3 + 1;
            push(&format!("encoder.{norm}.weight"), &[c], 1.0);
            push(&format!("encoder.{norm}.bias"), &[c], 0.1);
            push(&format!("encoder.{norm}.running_mean"), &[c], 0.1);
            push(&format!("encoder.{norm}.running_var"), &[c], 1.0);
        }
    }
    for (block, (outputs, k)) in [(c, 3), (c, 3), (c, 3), (3, 5)].into_iter().enumerate() {
        push(&format!("decoder.{}.weight", block * 2), &[c, outputs, k, k], 0.3);
    }
    parse_model(&writer.finish().expect("encodable model")).expect("parsable model")
}

/// Random weights laid out like a trained digit classifier.
pub fn classifier_model() -> Model {
    let mut rng = rng(11);
    let mut writer = ModelWriter::new();
    let mut push = |name: &str, shape: &[u16], data: Vec<f32>| {
        writer.push(name, shape, &data).expect("valid tensor");
    };
    push("conv1.weight", &[8, 1, 3, 3], random_values(&mut rng, 72, 0.5));
    push("norm1.weight", &[8], vec![1.0; 8]);
    push("norm1.bias", &[8], vec![0.0; 8]);
    push("norm1.running_mean", &[8], random_values(&mut rng, 8, 0.1));
    push("norm1.running_var", &[8], vec![1.0; 8]);
    push("conv2.weight", &[16, 8, 3, 3], random_values(&mut rng, 1152, 0.2));
    push("norm2.weight", &[16], vec![1.0; 16]);
    push("norm2.bias", &[16], vec![0.0; 16]);
    push("norm2.running_mean", &[16], random_values(&mut rng, 16, 0.1));
    push("norm2.running_var", &[16], vec![2.0; 16]);
    push("dense.weight", &[10, 64], random_values(&mut rng, 640, 0.2));
    push("dense.bias", &[10], random_values(&mut rng, 10, 0.1));
    parse_model(&writer.finish().expect("encodable model")).expect("parsable model")
}
