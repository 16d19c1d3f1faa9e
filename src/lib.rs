//! # detexport
//!
//! Export single-stage detection checkpoints to self-contained ONNX graphs.
//!
//! ## CLI Usage
//!
//! ```bash
//! # Static 640x640 export with embedded NMS, simplified
//! detexport export yolov8n.safetensors --imgsz 640 --nms --simplify
//!
//! # Symbolic batch/height/width
//! detexport export yolov8n.safetensors --dynamic
//!
//! # Inspect an artifact
//! detexport info yolov8n.onnx
//!
//! # Re-simplify an existing ONNX file
//! detexport simplify model.onnx -o model.sim.onnx
//! ```
//!
//! ## Library Usage
//!
//! ```no_run
//! use detexport::{ExportOptions, Exporter};
//!
//! let report = Exporter::new(ExportOptions::default().with_nms(true)).export("yolov8n.safetensors")?;
//! println!("{}", report);
//! # Ok::<(), detexport::ExportError>(())
//! ```

// Re-export everything from the compiler crate
pub use detexport_compiler::*;

/// Get the version of detexport
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
