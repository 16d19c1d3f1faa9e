//! # Detection Model Export
//!
//! Turns a trained single-stage detector checkpoint into a self-contained
//! ONNX graph, optionally with non-maximum suppression embedded so the
//! artifact returns final detections.
//!
//! ## Export Flow
//!
//! ```text
//! checkpoint → Trace → Bind shapes → Embed NMS → Simplify → Serialize
//! ```
//!
//! ### Trace
//!
//! - Read the architecture record and weights from a `.safetensors` file
//! - Emit graph IR module by module, stopping at the first unsupported module
//!
//! ### Bind shapes
//!
//! - Static: every dimension becomes concrete for the requested input size
//! - Dynamic: batch, height and width stay symbolic; derived dims are arithmetic
//!   over them
//!
//! ### Embed NMS
//!
//! - Decode boxes, score per class, suppress per class
//! - Fixed-length `boxes` / `scores` / `classes` outputs padded with sentinels
//!
//! ### Simplify
//!
//! - Constant folding, arithmetic identities, CSE, fusion and DCE repeated to a
//!   fixed point
//!
//! ### Serialize
//!
//! - Validate the graph, then write ONNX atomically
//!
//! ## Usage
//!
//! ```no_run
//! use detexport_compiler::{ExportOptions, Exporter};
//!
//! let options = ExportOptions::default()
//!     .with_imgsz(640, 640)
//!     .with_nms(true)
//!     .with_simplify(true);
//!
//! let report = Exporter::new(options).export("yolov8n.safetensors")?;
//! println!("{}", report);
//! # Ok::<(), detexport_compiler::ExportError>(())
//! ```

pub mod config;
pub mod error;
pub mod export;
pub mod graph;
pub mod import;
pub mod model;
pub mod nms;
pub mod proto;
pub mod runtime;
pub mod shape_inference;
pub mod trace;

// Re-exports for convenient access
pub use config::{CliOverrides, ConfigError, ExportConfig};
pub use error::{ExportError, Result};
pub use export::{ExportFormat, ExportOptions, ExportReport, Exporter, OnnxSerializer, StageTiming};
pub use graph::{Dim, Graph, GraphOptimizer, OpKind, OptimizationStats};
pub use import::{import_model, inspect_onnx, load_onnx, ModelSummary};
pub use model::{Architecture, Checkpoint, LayerFrom, LayerSpec};
pub use nms::{NmsConfig, NmsEmbedder};
pub use shape_inference::ShapeBinder;
pub use trace::Tracer;
