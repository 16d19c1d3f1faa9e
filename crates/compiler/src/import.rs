//! ONNX import
//!
//! Reads an ONNX `ModelProto` back into graph IR. Used to inspect and
//! re-simplify artifacts and to check that exported files evaluate like
//! the graphs they were written from.
//!
//! Every `dim_param` becomes a named axis symbol; operators outside
//! [`OpKind`] fail with `UnsupportedOperator`.

use crate::graph::{AttrValue, DataType, Dim, Graph, Node, OpKind, Shape, SymbolTable, TensorData, TensorInfo};
use crate::proto::{
    attribute_proto::AttributeType, tensor_shape_proto::dimension, type_proto, AttributeProto, ModelProto,
    TensorProto, ValueInfoProto,
};
use crate::{ExportError, Result};
use prost::Message;
use std::path::Path;
use tracing::debug;

/// Header fields of an ONNX file alongside its imported graph
#[derive(Debug)]
pub struct ModelSummary {
    pub ir_version: i64,
    pub opset: i64,
    pub producer: String,
    pub file_bytes: usize,
    pub graph: Graph,
}

/// Decode and import an ONNX file
pub fn load_onnx(path: impl AsRef<Path>) -> Result<Graph> {
    Ok(inspect_onnx(path)?.graph)
}

/// Decode an ONNX file, keeping the model header
pub fn inspect_onnx(path: impl AsRef<Path>) -> Result<ModelSummary> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    let model = ModelProto::decode(bytes.as_slice())?;
    debug!("Decoded {} ({} bytes)", path.display(), bytes.len());
    let opset = model
        .opset_import
        .iter()
        .find(|o| o.domain.is_empty() || o.domain == "ai.onnx")
        .map(|o| o.version)
        .unwrap_or_default();
    Ok(ModelSummary {
        ir_version: model.ir_version,
        opset,
        producer: model.producer_name.clone(),
        file_bytes: bytes.len(),
        graph: import_model(&model)?,
    })
}

/// Convert a decoded model into graph IR
pub fn import_model(model: &ModelProto) -> Result<Graph> {
    let proto = model
        .graph
        .as_ref()
        .ok_or_else(|| ExportError::InvalidModel("model has no graph".to_string()))?;
    let mut graph = Graph::new(proto.name.clone());

    for tensor in &proto.initializer {
        let data = tensor_from_proto(tensor)?;
        graph.add_initializer(&tensor.name, data)?;
    }

    for input in &proto.input {
        // older exporters list initializers among the inputs
        if graph.is_initializer(&input.name) {
            continue;
        }
        let (dtype, shape) = value_info_type(&mut graph.symbols, input)?;
        let dtype = dtype.ok_or_else(|| ExportError::InvalidModel(format!("input '{}' has no element type", input.name)))?;
        let shape = shape.ok_or_else(|| ExportError::InvalidModel(format!("input '{}' has no shape", input.name)))?;
        graph.add_input(&input.name, dtype, shape)?;
    }

    for (index, node) in proto.node.iter().enumerate() {
        if !(node.domain.is_empty() || node.domain == "ai.onnx") {
            return Err(ExportError::unsupported(
                format!("{}::{}", node.domain, node.op_type),
                node_label(&node.name, index),
            ));
        }
        let op = OpKind::from_op_type(&node.op_type)
            .ok_or_else(|| ExportError::unsupported(node.op_type.as_str(), node_label(&node.name, index)))?;
        let name = if node.name.is_empty() {
            format!("{}_{}", node.op_type, index)
        } else {
            node.name.clone()
        };
        let mut imported = Node::new(name.clone(), op).with_inputs(&node.input).with_outputs(&node.output);
        for attr in &node.attribute {
            let value = attribute_from_proto(attr, &name)?;
            imported = imported.with_attr(&attr.name, value);
        }
        graph.add_node(imported)?;
    }

    for info in proto.value_info.iter().chain(&proto.output) {
        if graph.tensor(&info.name).is_none() {
            continue;
        }
        let (dtype, shape) = value_info_type(&mut graph.symbols, info)?;
        graph.set_tensor_info(&info.name, TensorInfo { dtype, shape });
    }
    for output in &proto.output {
        graph.add_output(&output.name)?;
    }

    for prop in &model.metadata_props {
        graph.metadata.insert(prop.key.clone(), prop.value.clone());
    }

    debug!(
        "Imported {}: {} nodes, {} initializers, opset {}",
        graph.name,
        graph.node_count(),
        graph.initializers().len(),
        model.opset_import.first().map(|o| o.version).unwrap_or_default()
    );
    Ok(graph)
}

fn node_label(name: &str, index: usize) -> String {
    if name.is_empty() {
        format!("node {}", index)
    } else {
        name.to_string()
    }
}

/// Element type and shape declared by a value info
fn value_info_type(symbols: &mut SymbolTable, info: &ValueInfoProto) -> Result<(Option<DataType>, Option<Shape>)> {
    let Some(type_proto::Value::TensorType(tensor)) = info.r#type.as_ref().and_then(|t| t.value.as_ref()) else {
        return Ok((None, None));
    };
    let dtype = DataType::from_onnx_code(tensor.elem_type);
    if dtype.is_none() && tensor.elem_type != 0 {
        return Err(ExportError::InvalidModel(format!(
            "tensor '{}' has unsupported element type {}",
            info.name, tensor.elem_type
        )));
    }
    let shape = tensor.shape.as_ref().map(|shape| {
        shape
            .dim
            .iter()
            .map(|d| match &d.value {
                Some(dimension::Value::DimValue(v)) => Dim::Fixed(*v),
                Some(dimension::Value::DimParam(p)) => Dim::Symbolic(symbols.axis(p)),
                None => symbols.opaque("unk"),
            })
            .collect()
    });
    Ok((dtype, shape))
}

/// Decode an ONNX tensor (raw or typed storage)
pub fn tensor_from_proto(tensor: &TensorProto) -> Result<TensorData> {
    let dtype = DataType::from_onnx_code(tensor.data_type).ok_or_else(|| {
        ExportError::InvalidModel(format!(
            "tensor '{}' has unsupported data type {}",
            tensor.name, tensor.data_type
        ))
    })?;
    let shape = tensor
        .dims
        .iter()
        .map(|&d| usize::try_from(d))
        .collect::<std::result::Result<Vec<usize>, _>>()
        .map_err(|_| ExportError::InvalidModel(format!("tensor '{}' has a negative dimension", tensor.name)))?;
    if !tensor.raw_data.is_empty() {
        return TensorData::from_le_bytes(dtype, &shape, &tensor.raw_data);
    }
    match dtype {
        DataType::Float => TensorData::from_f32(&shape, tensor.float_data.clone()),
        DataType::Int64 => TensorData::from_i64(&shape, tensor.int64_data.clone()),
    }
}

fn attribute_from_proto(attr: &AttributeProto, node: &str) -> Result<AttrValue> {
    let kind = AttributeType::try_from(attr.r#type).unwrap_or(AttributeType::Undefined);
    Ok(match kind {
        AttributeType::Float => AttrValue::Float(attr.f),
        AttributeType::Int => AttrValue::Int(attr.i),
        AttributeType::String => AttrValue::String(String::from_utf8_lossy(&attr.s).into_owned()),
        AttributeType::Tensor => {
            let tensor = attr
                .t
                .as_ref()
                .ok_or_else(|| ExportError::InvalidModel(format!("{}: attribute '{}' has no tensor", node, attr.name)))?;
            AttrValue::Tensor(tensor_from_proto(tensor)?)
        }
        AttributeType::Floats => AttrValue::Floats(attr.floats.clone()),
        AttributeType::Ints => AttrValue::Ints(attr.ints.clone()),
        other => {
            return Err(ExportError::InvalidModel(format!(
                "{}: attribute '{}' has unsupported type {:?}",
                node, attr.name, other
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{
        tensor_shape_proto, GraphProto, NodeProto, OperatorSetIdProto, TensorShapeProto, TypeProto,
    };

    fn value_info(name: &str, dims: &[&str]) -> ValueInfoProto {
        let dim = dims
            .iter()
            .map(|d| tensor_shape_proto::Dimension {
                value: Some(match d.parse::<i64>() {
                    Ok(v) => dimension::Value::DimValue(v),
                    Err(_) => dimension::Value::DimParam(d.to_string()),
                }),
                ..Default::default()
            })
            .collect();
        ValueInfoProto {
            name: name.to_string(),
            r#type: Some(TypeProto {
                value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                    elem_type: 1,
                    shape: Some(TensorShapeProto { dim }),
                })),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn model(op_type: &str) -> ModelProto {
        ModelProto {
            ir_version: 8,
            opset_import: vec![OperatorSetIdProto {
                domain: String::new(),
                version: 17,
            }],
            graph: Some(GraphProto {
                name: "g".to_string(),
                node: vec![NodeProto {
                    input: vec!["x".to_string()],
                    output: vec!["y".to_string()],
                    op_type: op_type.to_string(),
                    attribute: vec![AttributeProto {
                        name: "axis".to_string(),
                        i: 1,
                        r#type: AttributeType::Int as i32,
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                input: vec![value_info("x", &["batch", "4"])],
                output: vec![value_info("y", &["batch", "4"])],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_imports_nodes_and_symbolic_inputs() {
        let graph = import_model(&model("Softmax")).unwrap();
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.nodes()[0].name, "Softmax_0");
        assert_eq!(graph.nodes()[0].attr_int("axis"), Some(1));
        let shape = graph.tensor_shape("x").unwrap();
        assert_eq!(graph.symbols.render_dim(shape[0]), "batch");
        assert_eq!(shape[1], Dim::Fixed(4));
        assert_eq!(graph.outputs(), &["y"]);
    }

    #[test]
    fn test_unknown_op_type_is_unsupported() {
        let err = import_model(&model("LayerNormalization")).unwrap_err();
        assert_eq!(err.kind(), "UnsupportedOperator");
        assert!(err.to_string().contains("LayerNormalization"));
    }

    #[test]
    fn test_typed_tensor_storage() {
        let tensor = TensorProto {
            name: "w".to_string(),
            dims: vec![2],
            data_type: 7,
            int64_data: vec![3, -4],
            ..Default::default()
        };
        assert_eq!(tensor_from_proto(&tensor).unwrap(), TensorData::i64_vec(&[3, -4]));
    }
}
