//! Synthetic detection checkpoints for integration tests
//!
//! A scaled-down three-level detector (strides 8/16/32) with the same module
//! layout and weight naming as full-size checkpoints, filled with seeded
//! random weights.

#![allow(dead_code)]

use detexport_compiler::graph::TensorData;
use detexport_compiler::model::{Architecture, Checkpoint, LayerFrom, LayerSpec};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const REG_MAX: usize = 16;

struct WeightBuilder {
    rng: StdRng,
    weights: BTreeMap<String, TensorData>,
}

impl WeightBuilder {
    fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            weights: BTreeMap::new(),
        }
    }

    fn uniform(&mut self, name: String, shape: &[usize], low: f32, high: f32) {
        let count = shape.iter().product();
        let values = (0..count).map(|_| self.rng.gen_range(low..high)).collect();
        self.weights.insert(name, TensorData::from_f32(shape, values).unwrap());
    }

    /// Conv + BatchNorm weights under `prefix`
    fn conv_block(&mut self, prefix: &str, c_in: usize, c_out: usize, k: usize) {
        let bound = (1.0 / (c_in * k * k) as f32).sqrt();
        self.uniform(format!("{}.conv.weight", prefix), &[c_out, c_in, k, k], -bound, bound);
        self.uniform(format!("{}.bn.weight", prefix), &[c_out], 0.5, 1.5);
        self.uniform(format!("{}.bn.bias", prefix), &[c_out], -0.1, 0.1);
        self.uniform(format!("{}.bn.running_mean", prefix), &[c_out], -0.1, 0.1);
        self.uniform(format!("{}.bn.running_var", prefix), &[c_out], 0.5, 1.5);
    }

    /// Biased 1x1 Conv under `prefix`
    fn projection(&mut self, prefix: &str, c_in: usize, c_out: usize) {
        let bound = (1.0 / c_in as f32).sqrt();
        self.uniform(format!("{}.weight", prefix), &[c_out, c_in, 1, 1], -bound, bound);
        self.uniform(format!("{}.bias", prefix), &[c_out], -1.0, 1.0);
    }

    fn c2f(&mut self, prefix: &str, c_in: usize, c_out: usize, repeats: usize) {
        let hidden = c_out / 2;
        self.conv_block(&format!("{}.cv1", prefix), c_in, 2 * hidden, 1);
        for j in 0..repeats {
            self.conv_block(&format!("{}.m.{}.cv1", prefix, j), hidden, hidden, 3);
            self.conv_block(&format!("{}.m.{}.cv2", prefix, j), hidden, hidden, 3);
        }
        self.conv_block(&format!("{}.cv2", prefix), (2 + repeats) * hidden, c_out, 1);
    }
}

fn layer(from: Value, repeats: usize, module: &str, args: Value) -> LayerSpec {
    let from: LayerFrom = serde_json::from_value(from).unwrap();
    let args = args.as_array().cloned().unwrap_or_default();
    LayerSpec::new(from, repeats, module, args)
}

/// Layer table of the synthetic detector
pub fn tiny_architecture(nc: usize) -> Architecture {
    Architecture {
        name: "tiny-det".to_string(),
        nc,
        names: (0..nc).map(|i| format!("class{}", i)).collect(),
        reg_max: REG_MAX,
        layers: vec![
            layer(json!(-1), 1, "Conv", json!([8, 3, 2])),
            layer(json!(-1), 1, "Conv", json!([16, 3, 2])),
            layer(json!(-1), 1, "C2f", json!([16, true])),
            layer(json!(-1), 1, "Conv", json!([32, 3, 2])),
            layer(json!(-1), 1, "Conv", json!([32, 3, 2])),
            layer(json!(-1), 1, "Conv", json!([64, 3, 2])),
            layer(json!(-1), 1, "SPPF", json!([64, 5])),
            layer(json!(-1), 1, "nn.Upsample", json!([null, 2, "nearest"])),
            layer(json!([-1, 4]), 1, "Concat", json!([1])),
            layer(json!(-1), 1, "C2f", json!([32, false])),
            layer(json!([3, 9, 6]), 1, "Detect", json!([nc])),
        ],
    }
}

/// Seeded synthetic checkpoint with `nc` classes
pub fn tiny_checkpoint(nc: usize, seed: u64) -> Checkpoint {
    let mut w = WeightBuilder::new(seed);
    w.conv_block("model.0", 3, 8, 3);
    w.conv_block("model.1", 8, 16, 3);
    w.c2f("model.2", 16, 16, 1);
    w.conv_block("model.3", 16, 32, 3);
    w.conv_block("model.4", 32, 32, 3);
    w.conv_block("model.5", 32, 64, 3);
    w.conv_block("model.6.cv1", 64, 32, 1);
    w.conv_block("model.6.cv2", 128, 64, 1);
    w.c2f("model.9", 96, 32, 1);

    for (level, channels) in [32, 32, 64].into_iter().enumerate() {
        for (branch, out) in [("cv2", 4 * REG_MAX), ("cv3", nc)] {
            let base = format!("model.10.{}.{}", branch, level);
            w.conv_block(&format!("{}.0", base), channels, 16, 3);
            w.conv_block(&format!("{}.1", base), 16, 16, 3);
            w.projection(&format!("{}.2", base), 16, out);
        }
    }
    let bins: Vec<f32> = (0..REG_MAX).map(|i| i as f32).collect();
    w.weights.insert(
        "model.10.dfl.conv.weight".to_string(),
        TensorData::from_f32(&[1, REG_MAX, 1, 1], bins).unwrap(),
    );

    Checkpoint::new(tiny_architecture(nc), w.weights)
}

/// Write a synthetic checkpoint into `dir`
pub fn write_checkpoint(dir: &Path, nc: usize, seed: u64) -> PathBuf {
    let path = dir.join("tiny-det.safetensors");
    tiny_checkpoint(nc, seed).save(&path).unwrap();
    path
}

/// Seeded `[1, 3, h, w]` image in `[0, 1)`
pub fn random_image(height: usize, width: usize, seed: u64) -> TensorData {
    let mut rng = StdRng::seed_from_u64(seed);
    let values = (0..3 * height * width).map(|_| rng.gen::<f32>()).collect();
    TensorData::from_f32(&[1, 3, height, width], values).unwrap()
}

/// Largest absolute elementwise difference
pub fn max_abs_diff(a: &TensorData, b: &TensorData) -> f32 {
    assert_eq!(a.shape(), b.shape());
    let a = a.to_f32_vec().unwrap();
    let b = b.to_f32_vec().unwrap();
    a.iter().zip(&b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}
