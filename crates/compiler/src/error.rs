//! Error types for the export pipeline

use std::io;
use thiserror::Error;

/// Result type for export operations
pub type Result<T> = std::result::Result<T, ExportError>;

/// Errors that can occur while exporting a detection model
///
/// Every variant names the node, tensor or invariant involved so a failed
/// export can be diagnosed without re-running it.
#[derive(Debug, Error)]
pub enum ExportError {
    /// The source model uses an operator the graph IR cannot represent
    #[error("Unsupported operator '{op}' at {node}")]
    UnsupportedOperator { op: String, node: String },

    /// A dimension could not be resolved to the required form
    #[error("Shape resolution failed for tensor '{tensor}': {reason}")]
    ShapeResolution { tensor: String, reason: String },

    /// The detection head layout is not one the NMS subgraph understands
    #[error("NMS embedding failed at tensor '{tensor}': {reason}")]
    NmsEmbedding { tensor: String, reason: String },

    /// The final graph violates an invariant required for serialization
    #[error("Serialization failed: {invariant}")]
    Serialization { invariant: String },

    #[error("Invalid model structure: {0}")]
    InvalidModel(String),

    #[error("Invalid export options: {0}")]
    InvalidOptions(String),

    #[error("Evaluation of node '{node}' failed: {reason}")]
    Evaluation { node: String, reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Safetensors error: {0}")]
    SafetensorsError(#[from] safetensors::SafeTensorError),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Protobuf decode error: {0}")]
    DecodeError(#[from] prost::DecodeError),
}

impl ExportError {
    pub(crate) fn unsupported(op: impl Into<String>, node: impl Into<String>) -> Self {
        ExportError::UnsupportedOperator {
            op: op.into(),
            node: node.into(),
        }
    }

    pub(crate) fn shape(tensor: impl Into<String>, reason: impl Into<String>) -> Self {
        ExportError::ShapeResolution {
            tensor: tensor.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn nms(tensor: impl Into<String>, reason: impl Into<String>) -> Self {
        ExportError::NmsEmbedding {
            tensor: tensor.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn serialization(invariant: impl Into<String>) -> Self {
        ExportError::Serialization {
            invariant: invariant.into(),
        }
    }

    pub(crate) fn eval(node: impl Into<String>, reason: impl Into<String>) -> Self {
        ExportError::Evaluation {
            node: node.into(),
            reason: reason.into(),
        }
    }

    /// Short machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            ExportError::UnsupportedOperator { .. } => "UnsupportedOperator",
            ExportError::ShapeResolution { .. } => "ShapeResolutionError",
            ExportError::NmsEmbedding { .. } => "NMSEmbeddingError",
            ExportError::Serialization { .. } => "SerializationError",
            ExportError::InvalidModel(_) => "InvalidModel",
            ExportError::InvalidOptions(_) => "InvalidOptions",
            ExportError::Evaluation { .. } => "EvaluationError",
            ExportError::IoError(_) => "IoError",
            ExportError::SafetensorsError(_) => "SafetensorsError",
            ExportError::JsonError(_) => "JsonError",
            ExportError::DecodeError(_) => "DecodeError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_entity() {
        let err = ExportError::unsupported("C3k2", "model.4");
        assert_eq!(err.to_string(), "Unsupported operator 'C3k2' at model.4");
        assert_eq!(err.kind(), "UnsupportedOperator");

        let err = ExportError::shape("/model.0/conv/Conv_output_0", "unknown spatial size");
        assert!(err.to_string().contains("/model.0/conv/Conv_output_0"));
        assert_eq!(err.kind(), "ShapeResolutionError");
    }

    #[test]
    fn test_io_error_conversion() {
        let err: ExportError = io::Error::new(io::ErrorKind::NotFound, "missing").into();
        assert!(matches!(err, ExportError::IoError(_)));
    }
}
