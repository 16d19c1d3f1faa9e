//! Export pipeline
//!
//! ```text
//! checkpoint (.safetensors)
//!     ↓
//! 1. Trace   → graph IR with symbolic batch/height/width
//!     ↓
//! 2. Bind    → concrete shapes (static) or symbolic arithmetic (dynamic)
//!     ↓
//! 3. NMS     → boxes / scores / classes outputs          (if requested)
//!     ↓
//! 4. Simplify→ folding, fusion, CSE, DCE to a fixed point (if requested)
//!     ↓
//! 5. Write   → validated, atomically written ONNX file
//! ```
//!
//! # Example
//!
//! ```no_run
//! use detexport_compiler::{ExportOptions, Exporter};
//!
//! let options = ExportOptions::default().with_nms(true).with_simplify(true);
//! let report = Exporter::new(options).export("yolov8n.safetensors")?;
//! println!("{}", report);
//! # Ok::<(), detexport_compiler::ExportError>(())
//! ```

mod serializer;

pub use serializer::{tensor_proto, OnnxSerializer, SerializerStats, IR_VERSION, OPSET_VERSION, PRODUCER_NAME};

use crate::graph::{Graph, GraphOptimizer, OptimizationStats};
use crate::model::Checkpoint;
use crate::nms::{NmsConfig, NmsEmbedder};
use crate::shape_inference::ShapeBinder;
use crate::trace::Tracer;
use crate::{ExportError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Stride used when the traced graph does not record one
const DEFAULT_STRIDE: usize = 32;

/// Artifact formats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Onnx,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Onnx => "onnx",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Onnx => write!(f, "onnx"),
        }
    }
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "onnx" => Ok(ExportFormat::Onnx),
            other => Err(ExportError::InvalidOptions(format!("unsupported format '{}'", other))),
        }
    }
}

/// Immutable export request
#[derive(Debug, Clone, PartialEq)]
pub struct ExportOptions {
    pub format: ExportFormat,
    /// Input size as (height, width)
    pub imgsz: (usize, usize),
    pub batch: usize,
    pub nms: bool,
    pub dynamic: bool,
    pub simplify: bool,
    pub iou: f32,
    pub conf: f32,
    pub max_det: usize,
    /// Artifact path; derived from the checkpoint path when unset
    pub output: Option<PathBuf>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            format: ExportFormat::Onnx,
            imgsz: (640, 640),
            batch: 1,
            nms: false,
            dynamic: false,
            simplify: false,
            iou: 0.7,
            conf: 0.25,
            max_det: 300,
            output: None,
        }
    }
}

impl ExportOptions {
    pub fn with_imgsz(mut self, height: usize, width: usize) -> Self {
        self.imgsz = (height, width);
        self
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_nms(mut self, nms: bool) -> Self {
        self.nms = nms;
        self
    }

    pub fn with_dynamic(mut self, dynamic: bool) -> Self {
        self.dynamic = dynamic;
        self
    }

    pub fn with_simplify(mut self, simplify: bool) -> Self {
        self.simplify = simplify;
        self
    }

    pub fn with_iou(mut self, iou: f32) -> Self {
        self.iou = iou;
        self
    }

    pub fn with_conf(mut self, conf: f32) -> Self {
        self.conf = conf;
        self
    }

    pub fn with_max_det(mut self, max_det: usize) -> Self {
        self.max_det = max_det;
        self
    }

    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Reject option combinations no export can satisfy
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ExportError::InvalidOptions(msg));
        if self.imgsz.0 == 0 || self.imgsz.1 == 0 {
            return invalid(format!("imgsz must be positive, got {:?}", self.imgsz));
        }
        if self.batch == 0 {
            return invalid("batch must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.iou) {
            return invalid(format!("iou must be in [0, 1], got {}", self.iou));
        }
        if !(0.0..=1.0).contains(&self.conf) {
            return invalid(format!("conf must be in [0, 1], got {}", self.conf));
        }
        if self.max_det == 0 {
            return invalid("max_det must be positive".to_string());
        }
        if self.nms && self.batch != 1 {
            return invalid(format!("NMS export is single-image; batch must be 1, got {}", self.batch));
        }
        Ok(())
    }

    /// Round the input size up to a multiple of `stride`
    pub fn check_imgsz(&self, stride: usize) -> (usize, usize) {
        let round = |v: usize| v.div_ceil(stride) * stride;
        let adjusted = (round(self.imgsz.0), round(self.imgsz.1));
        if adjusted != self.imgsz {
            warn!(
                "imgsz {:?} must be a multiple of max stride {}, updating to {:?}",
                self.imgsz, stride, adjusted
            );
        }
        adjusted
    }

    fn nms_config(&self) -> NmsConfig {
        NmsConfig {
            iou_threshold: self.iou,
            score_threshold: self.conf,
            max_detections: self.max_det,
        }
    }
}

/// Per-stage wall time
#[derive(Debug, Clone, PartialEq)]
pub struct StageTiming {
    pub stage: &'static str,
    pub time: Duration,
}

/// Summary of a finished export
#[derive(Debug, Clone)]
pub struct ExportReport {
    pub output: PathBuf,
    /// `(name, rendered shape)` of each graph input
    pub inputs: Vec<(String, String)>,
    pub outputs: Vec<(String, String)>,
    pub traced_nodes: usize,
    pub final_nodes: usize,
    pub artifact_bytes: u64,
    pub simplification: Option<OptimizationStats>,
    pub stages: Vec<StageTiming>,
}

impl ExportReport {
    pub fn total_time(&self) -> Duration {
        self.stages.iter().map(|s| s.time).sum()
    }
}

impl fmt::Display for ExportReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Exported {} ({:.2} MB, {} nodes)",
            self.output.display(),
            self.artifact_bytes as f64 / 1_000_000.0,
            self.final_nodes
        )?;
        for (name, shape) in &self.inputs {
            writeln!(f, "  input  {:<10} {}", name, shape)?;
        }
        for (name, shape) in &self.outputs {
            writeln!(f, "  output {:<10} {}", name, shape)?;
        }
        if let Some(stats) = &self.simplification {
            writeln!(
                f,
                "  simplified {} -> {} nodes in {} iterations",
                stats.original_nodes, stats.optimized_nodes, stats.iterations
            )?;
        }
        let stages: Vec<String> = self
            .stages
            .iter()
            .map(|s| format!("{} {:.1?}", s.stage, s.time))
            .collect();
        write!(f, "  stages: {} (total {:.1?})", stages.join(" | "), self.total_time())
    }
}

/// Graph produced by the in-memory stages, before writing
#[derive(Debug, Clone)]
pub struct BuiltGraph {
    pub graph: Graph,
    pub traced_nodes: usize,
    pub simplification: Option<OptimizationStats>,
    pub stages: Vec<StageTiming>,
}

/// Runs the export stages for one options record
#[derive(Debug, Clone)]
pub struct Exporter {
    options: ExportOptions,
}

impl Exporter {
    pub fn new(options: ExportOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ExportOptions {
        &self.options
    }

    /// `<stem>.onnx` beside the checkpoint, unless an output was given
    pub fn output_path_for(&self, model: &Path) -> PathBuf {
        match &self.options.output {
            Some(output) => output.clone(),
            None => model.with_extension(self.options.format.extension()),
        }
    }

    fn binder(&self, imgsz: (usize, usize)) -> ShapeBinder {
        let options = &self.options;
        if options.dynamic {
            let binder = ShapeBinder::new(true);
            // NMS output is single-image
            if options.nms {
                binder.with_axis("batch", 1)
            } else {
                binder
            }
        } else {
            ShapeBinder::new(false)
                .with_axis("batch", options.batch as i64)
                .with_axis("height", imgsz.0 as i64)
                .with_axis("width", imgsz.1 as i64)
        }
    }

    /// Trace, bind, embed NMS and simplify
    pub fn build_graph(&self, checkpoint: &Checkpoint) -> Result<BuiltGraph> {
        self.options.validate()?;
        let options = &self.options;
        let mut stages = Vec::new();

        let start = Instant::now();
        let graph = Tracer::new().trace(checkpoint)?;
        let traced_nodes = graph.node_count();
        stages.push(StageTiming {
            stage: "trace",
            time: start.elapsed(),
        });

        let stride = graph
            .metadata
            .get("stride")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(DEFAULT_STRIDE)
            .max(1);
        let imgsz = options.check_imgsz(stride);

        let start = Instant::now();
        let binder = self.binder(imgsz);
        let mut graph = binder.bind(graph)?;
        stages.push(StageTiming {
            stage: "bind",
            time: start.elapsed(),
        });
        info!(
            "Bound shapes ({}): images {}",
            if options.dynamic { "dynamic" } else { "static" },
            graph
                .tensor_shape(crate::trace::INPUT_NAME)
                .map(|s| graph.symbols.render_shape(s))
                .unwrap_or_default()
        );

        if options.nms {
            let start = Instant::now();
            graph = NmsEmbedder::new(checkpoint.architecture.nc, options.nms_config()).embed(graph, &binder)?;
            stages.push(StageTiming {
                stage: "nms",
                time: start.elapsed(),
            });
        }

        let simplification = if options.simplify {
            let start = Instant::now();
            let stats = GraphOptimizer::new().optimize(&mut graph)?;
            stages.push(StageTiming {
                stage: "simplify",
                time: start.elapsed(),
            });
            Some(stats)
        } else {
            None
        };

        graph.metadata.insert("imgsz".to_string(), format!("[{}, {}]", imgsz.0, imgsz.1));
        graph.metadata.insert("batch".to_string(), options.batch.to_string());
        graph.metadata.insert("dynamic".to_string(), options.dynamic.to_string());

        Ok(BuiltGraph {
            graph,
            traced_nodes,
            simplification,
            stages,
        })
    }

    /// Export a checkpoint file; the artifact lands beside it by default
    pub fn export(&self, model: impl AsRef<Path>) -> Result<ExportReport> {
        let model = model.as_ref();
        let start = Instant::now();
        let checkpoint = Checkpoint::load(model)?;
        let load = StageTiming {
            stage: "load",
            time: start.elapsed(),
        };
        let mut report = self.export_checkpoint(&checkpoint, &self.output_path_for(model))?;
        report.stages.insert(0, load);
        Ok(report)
    }

    /// Export an in-memory checkpoint to `output`
    pub fn export_checkpoint(&self, checkpoint: &Checkpoint, output: &Path) -> Result<ExportReport> {
        let BuiltGraph {
            graph,
            traced_nodes,
            simplification,
            mut stages,
        } = self.build_graph(checkpoint)?;

        let start = Instant::now();
        let serializer = OnnxSerializer::new().with_static_shapes(!self.options.dynamic);
        let stats = serializer.serialize(&graph, output)?;
        stages.push(StageTiming {
            stage: "write",
            time: start.elapsed(),
        });

        let describe = |names: &[String]| -> Vec<(String, String)> {
            names
                .iter()
                .map(|name| {
                    let shape = graph
                        .tensor_shape(name)
                        .map(|s| graph.symbols.render_shape(s))
                        .unwrap_or_default();
                    (name.clone(), shape)
                })
                .collect()
        };
        let report = ExportReport {
            output: output.to_path_buf(),
            inputs: describe(graph.inputs()),
            outputs: describe(graph.outputs()),
            traced_nodes,
            final_nodes: graph.node_count(),
            artifact_bytes: stats.total_bytes,
            simplification,
            stages,
        };
        info!("Export complete in {:.1?}", report.total_time());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = ExportOptions::default();
        assert_eq!(options.format, ExportFormat::Onnx);
        assert_eq!(options.imgsz, (640, 640));
        assert!(!options.nms && !options.dynamic && !options.simplify);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_invalid_options() {
        assert!(ExportOptions::default().with_iou(1.5).validate().is_err());
        assert!(ExportOptions::default().with_max_det(0).validate().is_err());
        assert!(ExportOptions::default().with_nms(true).with_batch(4).validate().is_err());
        assert!(ExportOptions::default().with_imgsz(0, 640).validate().is_err());
    }

    #[test]
    fn test_imgsz_rounds_up_to_stride() {
        let options = ExportOptions::default().with_imgsz(630, 641);
        assert_eq!(options.check_imgsz(32), (640, 672));
        assert_eq!(ExportOptions::default().check_imgsz(32), (640, 640));
    }

    #[test]
    fn test_output_path_derivation() {
        let exporter = Exporter::new(ExportOptions::default());
        assert_eq!(
            exporter.output_path_for(Path::new("runs/yolov8n.safetensors")),
            PathBuf::from("runs/yolov8n.onnx")
        );
        let exporter = Exporter::new(ExportOptions::default().with_output("out/model.onnx"));
        assert_eq!(
            exporter.output_path_for(Path::new("yolov8n.safetensors")),
            PathBuf::from("out/model.onnx")
        );
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("ONNX".parse::<ExportFormat>().unwrap(), ExportFormat::Onnx);
        assert!("tflite".parse::<ExportFormat>().is_err());
    }
}
