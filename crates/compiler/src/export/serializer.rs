//! ONNX serializer
//!
//! Validates a finished graph and writes it as an ONNX model (IR version 8,
//! opset 17). The write is atomic: bytes go to a temporary file in the
//! destination directory, which is flushed, synced and then renamed over the
//! target. A failed export leaves no file behind.

use crate::graph::{AttrValue, Dim, Graph, Node, Shape, SymbolOrigin, TensorData};
use crate::proto::{
    attribute_proto::AttributeType, tensor_shape_proto, type_proto, AttributeProto, GraphProto, ModelProto,
    NodeProto, OperatorSetIdProto, StringStringEntryProto, TensorProto, TensorShapeProto, TypeProto, ValueInfoProto,
};
use crate::{ExportError, Result};
use prost::Message;
use rustc_hash::FxHashSet;
use std::io::{BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, info};

pub const IR_VERSION: i64 = 8;
pub const OPSET_VERSION: i64 = 17;
pub const PRODUCER_NAME: &str = "detexport";

/// Serialization statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SerializerStats {
    pub total_bytes: u64,
    pub nodes: usize,
    pub initializers: usize,
    pub initializer_bytes: usize,
}

/// ONNX writer
#[derive(Debug, Clone)]
pub struct OnnxSerializer {
    static_shapes: bool,
}

impl OnnxSerializer {
    pub fn new() -> Self {
        Self { static_shapes: true }
    }

    /// Require every declared dimension to be an integer
    pub fn with_static_shapes(mut self, static_shapes: bool) -> Self {
        self.static_shapes = static_shapes;
        self
    }

    fn is_data_dependent(graph: &Graph, dim: Dim) -> bool {
        match graph.symbols.resolve(dim) {
            Dim::Symbolic(id) => graph.symbols.origin(id) == SymbolOrigin::DataDependent,
            Dim::Fixed(_) => false,
        }
    }

    /// Internal tensors whose shape depends on data are written without a
    /// value_info entry
    fn declares_shape(graph: &Graph, name: &str) -> bool {
        graph.is_graph_input(name)
            || graph.is_graph_output(name)
            || graph
                .tensor_shape(name)
                .is_some_and(|shape| !shape.iter().any(|&d| Self::is_data_dependent(graph, d)))
    }

    /// Check every invariant the artifact depends on
    pub fn validate(&self, graph: &Graph) -> Result<()> {
        if graph.outputs().is_empty() {
            return Err(ExportError::serialization("graph has no outputs"));
        }
        graph
            .validate_dag()
            .map_err(|e| ExportError::serialization(format!("graph is not a topologically ordered DAG: {}", e)))?;

        let produced: FxHashSet<&str> = graph
            .nodes()
            .iter()
            .flat_map(|n| n.outputs.iter().map(String::as_str))
            .collect();
        for output in graph.outputs() {
            if !produced.contains(output.as_str()) && !graph.is_graph_input(output) && !graph.is_initializer(output) {
                return Err(ExportError::serialization(format!("graph output '{}' is never produced", output)));
            }
        }

        for name in self.tensor_order(graph) {
            let info = graph.tensor(name).ok_or_else(|| {
                ExportError::serialization(format!("tensor '{}' has no metadata", name))
            })?;
            if info.dtype.is_none() {
                return Err(ExportError::serialization(format!("tensor '{}' has no element type", name)));
            }
            let Some(shape) = info.shape.as_ref() else {
                return Err(ExportError::serialization(format!("tensor '{}' has no shape", name)));
            };
            let boundary = graph.is_graph_input(name) || graph.is_graph_output(name);
            for &dim in shape {
                if boundary && Self::is_data_dependent(graph, dim) {
                    return Err(ExportError::serialization(format!(
                        "graph {} '{}' has data-dependent dimension '{}'",
                        if graph.is_graph_input(name) { "input" } else { "output" },
                        name,
                        graph.symbols.render_dim(dim)
                    )));
                }
                if self.static_shapes && Self::declares_shape(graph, name) && !graph.symbols.resolve(dim).is_fixed() {
                    return Err(ExportError::serialization(format!(
                        "static export declares symbolic dimension '{}' on tensor '{}'",
                        graph.symbols.render_dim(dim),
                        name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Inputs, node outputs in order, then initializers
    fn tensor_order<'g>(&self, graph: &'g Graph) -> Vec<&'g str> {
        let mut seen = FxHashSet::default();
        let mut order = Vec::new();
        let names = graph
            .inputs()
            .iter()
            .chain(graph.nodes().iter().flat_map(|n| n.outputs.iter()))
            .chain(graph.initializers().keys());
        for name in names {
            if seen.insert(name.as_str()) {
                order.push(name.as_str());
            }
        }
        order
    }

    fn shape_proto(graph: &Graph, shape: &Shape) -> TensorShapeProto {
        let dim = shape
            .iter()
            .map(|&d| tensor_shape_proto::Dimension {
                value: Some(match graph.symbols.resolve(d) {
                    Dim::Fixed(v) => tensor_shape_proto::dimension::Value::DimValue(v),
                    Dim::Symbolic(id) => tensor_shape_proto::dimension::Value::DimParam(graph.symbols.render(id)),
                }),
                ..Default::default()
            })
            .collect();
        TensorShapeProto { dim }
    }

    fn value_info(graph: &Graph, name: &str) -> Result<ValueInfoProto> {
        let info = graph
            .tensor(name)
            .ok_or_else(|| ExportError::serialization(format!("tensor '{}' has no metadata", name)))?;
        let dtype = info
            .dtype
            .ok_or_else(|| ExportError::serialization(format!("tensor '{}' has no element type", name)))?;
        Ok(ValueInfoProto {
            name: name.to_string(),
            r#type: Some(TypeProto {
                value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                    elem_type: dtype.onnx_code(),
                    shape: info.shape.as_ref().map(|s| Self::shape_proto(graph, s)),
                })),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// Build the protobuf model (after validation)
    pub fn to_model(&self, graph: &Graph) -> Result<ModelProto> {
        self.validate(graph)?;

        let node = graph.nodes().iter().map(node_proto).collect();
        let initializer = graph
            .initializers()
            .iter()
            .map(|(name, data)| tensor_proto(name, data))
            .collect();
        let input = graph
            .inputs()
            .iter()
            .map(|name| Self::value_info(graph, name))
            .collect::<Result<Vec<_>>>()?;
        let output = graph
            .outputs()
            .iter()
            .map(|name| Self::value_info(graph, name))
            .collect::<Result<Vec<_>>>()?;
        let value_info = graph
            .nodes()
            .iter()
            .flat_map(|n| n.outputs.iter())
            .filter(|name| !graph.is_graph_output(name) && Self::declares_shape(graph, name))
            .map(|name| Self::value_info(graph, name))
            .collect::<Result<Vec<_>>>()?;

        Ok(ModelProto {
            ir_version: IR_VERSION,
            opset_import: vec![OperatorSetIdProto {
                domain: String::new(),
                version: OPSET_VERSION,
            }],
            producer_name: PRODUCER_NAME.to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            graph: Some(GraphProto {
                node,
                name: graph.name.clone(),
                initializer,
                input,
                output,
                value_info,
                ..Default::default()
            }),
            metadata_props: graph
                .metadata
                .iter()
                .map(|(key, value)| StringStringEntryProto {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
            ..Default::default()
        })
    }

    /// Encode the graph without touching the filesystem
    pub fn to_bytes(&self, graph: &Graph) -> Result<Vec<u8>> {
        Ok(self.to_model(graph)?.encode_to_vec())
    }

    /// Validate and atomically write the graph to `path`
    pub fn serialize(&self, graph: &Graph, path: &Path) -> Result<SerializerStats> {
        let bytes = self.to_bytes(graph)?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        // dropped (and deleted) on every early return
        let temp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            writer.write_all(&bytes)?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| ExportError::IoError(e.error))?;
        debug!("Persisted {} bytes to {}", bytes.len(), path.display());

        let stats = SerializerStats {
            total_bytes: bytes.len() as u64,
            nodes: graph.node_count(),
            initializers: graph.initializers().len(),
            initializer_bytes: graph.initializers().values().map(|t| t.to_le_bytes().len()).sum(),
        };
        info!(
            "Wrote {} ({} nodes, {} initializers, {:.2} MB)",
            path.display(),
            stats.nodes,
            stats.initializers,
            stats.total_bytes as f64 / 1_000_000.0
        );
        Ok(stats)
    }
}

impl Default for OnnxSerializer {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a constant tensor as raw little-endian data
pub fn tensor_proto(name: &str, data: &TensorData) -> TensorProto {
    TensorProto {
        name: name.to_string(),
        dims: data.dims(),
        data_type: data.dtype().onnx_code(),
        raw_data: data.to_le_bytes(),
        ..Default::default()
    }
}

fn attribute_proto(name: &str, value: &AttrValue) -> AttributeProto {
    let mut attr = AttributeProto {
        name: name.to_string(),
        ..Default::default()
    };
    let kind = match value {
        AttrValue::Int(v) => {
            attr.i = *v;
            AttributeType::Int
        }
        AttrValue::Float(v) => {
            attr.f = *v;
            AttributeType::Float
        }
        AttrValue::Ints(v) => {
            attr.ints = v.clone();
            AttributeType::Ints
        }
        AttrValue::Floats(v) => {
            attr.floats = v.clone();
            AttributeType::Floats
        }
        AttrValue::String(v) => {
            attr.s = v.as_bytes().to_vec();
            AttributeType::String
        }
        AttrValue::Tensor(t) => {
            attr.t = Some(tensor_proto("", t));
            AttributeType::Tensor
        }
    };
    attr.r#type = kind as i32;
    attr
}

fn node_proto(node: &Node) -> NodeProto {
    NodeProto {
        input: node.inputs.clone(),
        output: node.outputs.clone(),
        name: node.name.clone(),
        op_type: node.op.as_str().to_string(),
        attribute: node
            .attributes
            .iter()
            .map(|(name, value)| attribute_proto(name, value))
            .collect(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{fixed_shape, DataType, OpKind, TensorInfo};
    use crate::import::import_model;

    fn small_graph() -> Graph {
        let mut graph = Graph::new("g");
        graph.add_input("x", DataType::Float, fixed_shape(&[1, 4])).unwrap();
        graph.add_initializer("w", TensorData::f32_vec(&[1.0, 2.0, 3.0, 4.0])).unwrap();
        graph
            .add_node(Node::new("mul", OpKind::Mul).with_inputs(&["x", "w"]).with_outputs(&["y"]))
            .unwrap();
        graph
            .add_node(
                Node::new("soft", OpKind::Softmax)
                    .with_inputs(&["y"])
                    .with_outputs(&["z"])
                    .with_attr("axis", AttrValue::Int(-1)),
            )
            .unwrap();
        graph.add_output("z").unwrap();
        graph.set_tensor_info("y", TensorInfo::new(DataType::Float, fixed_shape(&[1, 4])));
        graph.set_tensor_info("z", TensorInfo::new(DataType::Float, fixed_shape(&[1, 4])));
        graph.metadata.insert("stride".to_string(), "32".to_string());
        graph
    }

    #[test]
    fn test_model_header_and_roundtrip() {
        let graph = small_graph();
        let model = OnnxSerializer::new().to_model(&graph).unwrap();
        assert_eq!(model.ir_version, 8);
        assert_eq!(model.opset_import[0].version, 17);
        assert_eq!(model.producer_name, "detexport");

        let back = import_model(&model).unwrap();
        assert_eq!(back.node_count(), 2);
        assert_eq!(back.concrete_shape("z"), Some(vec![1, 4]));
        assert_eq!(back.initializer("w"), graph.initializer("w"));
        assert_eq!(back.metadata.get("stride").map(String::as_str), Some("32"));
        assert_eq!(back.nodes()[1].attr_int("axis"), Some(-1));
    }

    #[test]
    fn test_missing_element_type_is_rejected() {
        let mut graph = small_graph();
        graph.set_tensor_info("y", TensorInfo::default());
        let err = OnnxSerializer::new().validate(&graph).unwrap_err();
        assert_eq!(err.kind(), "SerializationError");
        assert!(err.to_string().contains("'y' has no element type"));
    }

    #[test]
    fn test_static_export_rejects_symbols() {
        let mut graph = small_graph();
        let batch = Dim::Symbolic(graph.symbols.axis("batch"));
        graph.set_tensor_info("z", TensorInfo::new(DataType::Float, vec![batch, Dim::Fixed(4)]));
        assert!(OnnxSerializer::new().validate(&graph).is_err());
        assert!(OnnxSerializer::new().with_static_shapes(false).validate(&graph).is_ok());
    }

    #[test]
    fn test_data_dependent_output_is_rejected() {
        let mut graph = small_graph();
        let count = graph.symbols.data_dependent("nms", Some(10));
        graph.set_tensor_info("z", TensorInfo::new(DataType::Float, vec![count, Dim::Fixed(4)]));
        let err = OnnxSerializer::new().with_static_shapes(false).validate(&graph).unwrap_err();
        assert!(err.to_string().contains("data-dependent"));
    }

    #[test]
    fn test_atomic_write_leaves_nothing_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");

        let mut broken = small_graph();
        broken.set_tensor_info("y", TensorInfo::default());
        assert!(OnnxSerializer::new().serialize(&broken, &path).is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let stats = OnnxSerializer::new().serialize(&small_graph(), &path).unwrap();
        assert_eq!(stats.total_bytes, std::fs::metadata(&path).unwrap().len());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_missing_directory_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("model.onnx");
        let err = OnnxSerializer::new().serialize(&small_graph(), &path).unwrap_err();
        assert!(matches!(err, ExportError::IoError(_)));
        assert!(!path.exists());
    }
}
