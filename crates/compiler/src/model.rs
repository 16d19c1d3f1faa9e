//! Detection checkpoints
//!
//! A checkpoint is a safetensors file whose `__metadata__` carries the
//! network description under the `architecture` key:
//!
//! ```json
//! {"name": "yolov8n", "nc": 80, "names": ["person", "bicycle"],
//!  "layers": [{"from": -1, "repeats": 1, "module": "Conv", "args": [16, 3, 2]}]}
//! ```
//!
//! Weights are named `model.{layer}.…` after the module tree. `F32` tensors
//! load as-is; `F16` and `BF16` are widened to f32; `I64` tensors stay integer.

use crate::graph::{DataType, TensorData};
use crate::{ExportError, Result};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::debug;

/// Metadata key holding the architecture JSON
pub const ARCHITECTURE_KEY: &str = "architecture";

/// Layer inputs: one previous layer or several (`-1` is the preceding layer)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LayerFrom {
    Single(i64),
    Multiple(Vec<i64>),
}

impl LayerFrom {
    /// Absolute layer indices for the layer at `index`
    pub fn resolve(&self, index: usize) -> Option<Vec<usize>> {
        let one = |f: i64| -> Option<usize> {
            if f < 0 {
                index.checked_sub(f.unsigned_abs() as usize)
            } else if (f as usize) < index {
                Some(f as usize)
            } else {
                None
            }
        };
        match self {
            LayerFrom::Single(f) => one(*f).map(|i| vec![i]),
            LayerFrom::Multiple(fs) => fs.iter().map(|&f| one(f)).collect(),
        }
    }
}

fn default_repeats() -> usize {
    1
}

/// One entry of the layer table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub from: LayerFrom,
    #[serde(default = "default_repeats")]
    pub repeats: usize,
    pub module: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl LayerSpec {
    pub fn new(from: LayerFrom, repeats: usize, module: &str, args: Vec<Value>) -> Self {
        Self {
            from,
            repeats,
            module: module.to_string(),
            args,
        }
    }

    pub fn arg_i64(&self, index: usize) -> Option<i64> {
        self.args.get(index).and_then(Value::as_i64)
    }

    pub fn arg_f64(&self, index: usize) -> Option<f64> {
        self.args.get(index).and_then(Value::as_f64)
    }

    pub fn arg_bool(&self, index: usize) -> Option<bool> {
        self.args.get(index).and_then(Value::as_bool)
    }

    pub fn arg_str(&self, index: usize) -> Option<&str> {
        self.args.get(index).and_then(Value::as_str)
    }
}

fn default_reg_max() -> usize {
    16
}

/// Network description stored in the checkpoint metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Architecture {
    pub name: String,
    /// Number of classes
    pub nc: usize,
    #[serde(default)]
    pub names: Vec<String>,
    /// DFL bins per box side
    #[serde(default = "default_reg_max")]
    pub reg_max: usize,
    pub layers: Vec<LayerSpec>,
}

impl Architecture {
    /// Class name for an index, falling back to the index itself
    pub fn class_name(&self, index: usize) -> String {
        self.names.get(index).cloned().unwrap_or_else(|| index.to_string())
    }
}

/// Trained detection model: architecture plus named weights
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub architecture: Architecture,
    weights: BTreeMap<String, TensorData>,
}

impl Checkpoint {
    pub fn new(architecture: Architecture, weights: BTreeMap<String, TensorData>) -> Self {
        Self { architecture, weights }
    }

    /// Load a checkpoint from a safetensors file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let checkpoint = Self::from_bytes(&data)?;
        debug!(
            "Loaded checkpoint {} ({} layers, {} weights) from {}",
            checkpoint.architecture.name,
            checkpoint.architecture.layers.len(),
            checkpoint.weights.len(),
            path.display()
        );
        Ok(checkpoint)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let (_, metadata) = SafeTensors::read_metadata(data)?;
        let architecture_json = metadata
            .metadata()
            .as_ref()
            .and_then(|m| m.get(ARCHITECTURE_KEY))
            .ok_or_else(|| {
                ExportError::InvalidModel(format!("checkpoint metadata has no '{}' entry", ARCHITECTURE_KEY))
            })?;
        let architecture: Architecture = serde_json::from_str(architecture_json)?;

        let tensors = SafeTensors::deserialize(data)?;
        let mut weights = BTreeMap::new();
        for (name, view) in tensors.tensors() {
            let tensor = decode_view(&name, &view)?;
            weights.insert(name, tensor);
        }
        Ok(Self { architecture, weights })
    }

    pub fn weights(&self) -> &BTreeMap<String, TensorData> {
        &self.weights
    }

    pub fn has_weight(&self, name: &str) -> bool {
        self.weights.contains_key(name)
    }

    /// Weight by name; a missing weight is a malformed checkpoint
    pub fn weight(&self, name: &str) -> Result<&TensorData> {
        self.weights
            .get(name)
            .ok_or_else(|| ExportError::InvalidModel(format!("checkpoint is missing weight '{}'", name)))
    }

    /// Total number of weight elements
    pub fn parameter_count(&self) -> usize {
        self.weights.values().map(TensorData::len).sum()
    }

    /// Encode as safetensors with the architecture in the metadata
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let encoded: Vec<(String, Dtype, Vec<usize>, Vec<u8>)> = self
            .weights
            .iter()
            .map(|(name, t)| {
                let dtype = match t.dtype() {
                    DataType::Float => Dtype::F32,
                    DataType::Int64 => Dtype::I64,
                };
                (name.clone(), dtype, t.shape().to_vec(), t.to_le_bytes())
            })
            .collect();
        let mut views = Vec::with_capacity(encoded.len());
        for (name, dtype, shape, bytes) in &encoded {
            views.push((name.as_str(), TensorView::new(*dtype, shape.clone(), bytes)?));
        }
        let mut metadata = HashMap::new();
        metadata.insert(ARCHITECTURE_KEY.to_string(), serde_json::to_string(&self.architecture)?);
        Ok(safetensors::serialize(views, &Some(metadata))?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }
}

fn decode_view(name: &str, view: &TensorView<'_>) -> Result<TensorData> {
    let shape = view.shape().to_vec();
    let bytes = view.data();
    match view.dtype() {
        Dtype::F32 => TensorData::from_le_bytes(DataType::Float, &shape, bytes),
        Dtype::F16 => {
            let values = bytes
                .chunks_exact(2)
                .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect();
            TensorData::from_f32(&shape, values)
        }
        Dtype::BF16 => {
            let values = bytes
                .chunks_exact(2)
                .map(|c| half::bf16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect();
            TensorData::from_f32(&shape, values)
        }
        Dtype::I64 => TensorData::from_le_bytes(DataType::Int64, &shape, bytes),
        other => Err(ExportError::InvalidModel(format!(
            "unsupported dtype {:?} for weight '{}'",
            other, name
        ))),
    }
}
