//! Reference CPU runtime
//!
//! Executes export graphs with `ndarray`. The simplifier uses it to fold
//! constant subgraphs and to probe fusion rewrites; tests use it to check that
//! an exported artifact computes the same function as the traced model.

mod kernels;

pub use kernels::{greedy_nms, iou};
pub(crate) use kernels::{batch_norm_affine, normalize_axis, slice_bounds, slice_plan, split_sizes, transpose_perm};

use crate::graph::{Graph, Node, OpKind, TensorData};
use crate::{ExportError, Result};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use tracing::trace;

fn required<'a>(node: &Node, inputs: &[Option<&'a TensorData>], slot: usize) -> Result<&'a TensorData> {
    inputs
        .get(slot)
        .copied()
        .flatten()
        .ok_or_else(|| ExportError::eval(node.name.clone(), format!("missing input {}", slot)))
}

fn optional<'a>(inputs: &[Option<&'a TensorData>], slot: usize) -> Option<&'a TensorData> {
    inputs.get(slot).copied().flatten()
}

fn optional_i64<'a>(node: &Node, inputs: &[Option<&'a TensorData>], slot: usize) -> Result<Option<&'a ndarray::ArrayD<i64>>> {
    optional(inputs, slot).map(|t| kernels::int64(node, t)).transpose()
}

fn optional_f32<'a>(node: &Node, inputs: &[Option<&'a TensorData>], slot: usize) -> Result<Option<&'a ndarray::ArrayD<f32>>> {
    optional(inputs, slot).map(|t| kernels::float(node, t)).transpose()
}

/// Evaluate one node on concrete inputs
///
/// `inputs` is aligned with `node.inputs`; `None` marks an omitted optional
/// input. Returns one tensor per node output.
pub fn eval_node(node: &Node, inputs: &[Option<&TensorData>]) -> Result<Vec<TensorData>> {
    use kernels::{float, int64};

    let single = |t: TensorData| -> Result<Vec<TensorData>> { Ok(vec![t]) };
    match node.op {
        OpKind::Conv => {
            let x = float(node, required(node, inputs, 0)?)?;
            let w = float(node, required(node, inputs, 1)?)?;
            let b = optional_f32(node, inputs, 2)?;
            single(TensorData::Float(kernels::conv(node, x, w, b)?))
        }
        OpKind::MaxPool => {
            let x = float(node, required(node, inputs, 0)?)?;
            single(TensorData::Float(kernels::max_pool(node, x)?))
        }
        OpKind::BatchNormalization => {
            let x = float(node, required(node, inputs, 0)?)?;
            let params = [
                float(node, required(node, inputs, 1)?)?,
                float(node, required(node, inputs, 2)?)?,
                float(node, required(node, inputs, 3)?)?,
                float(node, required(node, inputs, 4)?)?,
            ];
            single(TensorData::Float(kernels::batch_norm(node, x, params)?))
        }
        OpKind::Resize => {
            let x = float(node, required(node, inputs, 0)?)?;
            let scales = optional_f32(node, inputs, 2)?;
            let sizes = optional_i64(node, inputs, 3)?;
            single(TensorData::Float(kernels::resize(node, x, scales, sizes)?))
        }
        OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div => {
            let a = required(node, inputs, 0)?;
            let b = required(node, inputs, 1)?;
            single(kernels::binary(node, a, b)?)
        }
        OpKind::Sigmoid => {
            let x = float(node, required(node, inputs, 0)?)?;
            single(TensorData::Float(kernels::sigmoid(x)))
        }
        OpKind::Identity => single(required(node, inputs, 0)?.clone()),
        OpKind::Cast => single(kernels::cast(node, required(node, inputs, 0)?)?),
        OpKind::Concat => {
            let all = (0..node.inputs.len())
                .map(|slot| required(node, inputs, slot))
                .collect::<Result<Vec<_>>>()?;
            single(kernels::concat(node, &all)?)
        }
        OpKind::Split => {
            let x = required(node, inputs, 0)?;
            kernels::split(node, x, optional_i64(node, inputs, 1)?)
        }
        OpKind::Reshape => {
            let x = required(node, inputs, 0)?;
            let target = int64(node, required(node, inputs, 1)?)?;
            single(kernels::reshape(node, x, target)?)
        }
        OpKind::Transpose => single(kernels::transpose(node, required(node, inputs, 0)?)?),
        OpKind::Slice => {
            let x = required(node, inputs, 0)?;
            let params = [
                optional_i64(node, inputs, 1)?,
                optional_i64(node, inputs, 2)?,
                optional_i64(node, inputs, 3)?,
                optional_i64(node, inputs, 4)?,
            ];
            single(kernels::slice(node, x, params)?)
        }
        OpKind::Gather => {
            let x = required(node, inputs, 0)?;
            let indices = int64(node, required(node, inputs, 1)?)?;
            single(kernels::gather(node, x, indices)?)
        }
        OpKind::Unsqueeze => {
            let x = required(node, inputs, 0)?;
            single(kernels::unsqueeze(node, x, optional_i64(node, inputs, 1)?)?)
        }
        OpKind::Shape => {
            let x = required(node, inputs, 0)?;
            single(TensorData::i64_vec(&x.dims()))
        }
        OpKind::ConstantOfShape => {
            let shape = int64(node, required(node, inputs, 0)?)?;
            single(kernels::constant_of_shape(node, shape)?)
        }
        OpKind::CumSum => {
            let x = required(node, inputs, 0)?;
            let axis = int64(node, required(node, inputs, 1)?)?;
            single(kernels::cum_sum(node, x, axis)?)
        }
        OpKind::Softmax => {
            let x = float(node, required(node, inputs, 0)?)?;
            single(TensorData::Float(kernels::softmax(node, x)?))
        }
        OpKind::ReduceMax => {
            let x = float(node, required(node, inputs, 0)?)?;
            single(TensorData::Float(kernels::reduce_max(node, x, optional_i64(node, inputs, 1)?)?))
        }
        OpKind::ArgMax => {
            let x = float(node, required(node, inputs, 0)?)?;
            single(TensorData::Int64(kernels::arg_max(node, x)?))
        }
        OpKind::NonMaxSuppression => {
            let boxes = float(node, required(node, inputs, 0)?)?;
            let scores = float(node, required(node, inputs, 1)?)?;
            let selected = kernels::non_max_suppression(
                node,
                boxes,
                scores,
                optional_i64(node, inputs, 2)?,
                optional_f32(node, inputs, 3)?,
                optional_f32(node, inputs, 4)?,
            )?;
            single(TensorData::Int64(selected))
        }
    }
}

/// Run a whole graph on the given input feeds
///
/// Every graph input must be fed. Intermediate values are released after
/// their last consumer runs. Returns the graph outputs by name.
pub fn evaluate(graph: &Graph, feeds: &BTreeMap<String, TensorData>) -> Result<BTreeMap<String, TensorData>> {
    let mut values: FxHashMap<&str, TensorData> = FxHashMap::default();
    for input in graph.inputs() {
        let data = feeds
            .get(input)
            .ok_or_else(|| ExportError::InvalidOptions(format!("no value fed for graph input '{}'", input)))?;
        if let Some(expected) = graph.concrete_shape(input) {
            if expected != data.dims() {
                return Err(ExportError::InvalidOptions(format!(
                    "input '{}' expects shape {:?}, got {:?}",
                    input,
                    expected,
                    data.dims()
                )));
            }
        }
        values.insert(input.as_str(), data.clone());
    }

    let mut last_use: FxHashMap<&str, usize> = FxHashMap::default();
    for (idx, node) in graph.nodes().iter().enumerate() {
        for input in &node.inputs {
            last_use.insert(input.as_str(), idx);
        }
    }

    for (idx, node) in graph.nodes().iter().enumerate() {
        let outputs = {
            let inputs: Vec<Option<&TensorData>> = node
                .inputs
                .iter()
                .map(|name| {
                    if name.is_empty() {
                        Ok(None)
                    } else {
                        values
                            .get(name.as_str())
                            .or_else(|| graph.initializer(name))
                            .map(Some)
                            .ok_or_else(|| ExportError::eval(node.name.clone(), format!("no value for '{}'", name)))
                    }
                })
                .collect::<Result<_>>()?;
            eval_node(node, &inputs)?
        };
        trace!(node = %node.name, op = %node.op, "evaluated");
        if outputs.len() != node.outputs.len() {
            return Err(ExportError::eval(
                node.name.clone(),
                format!("produced {} outputs, expected {}", outputs.len(), node.outputs.len()),
            ));
        }
        for (name, data) in node.outputs.iter().zip(outputs) {
            values.insert(name.as_str(), data);
        }
        for input in &node.inputs {
            if last_use.get(input.as_str()) == Some(&idx) && !graph.is_graph_output(input) {
                values.remove(input.as_str());
            }
        }
    }

    graph
        .outputs()
        .iter()
        .map(|name| {
            values
                .remove(name.as_str())
                .or_else(|| graph.initializer(name).cloned())
                .map(|data| (name.clone(), data))
                .ok_or_else(|| ExportError::eval(name.clone(), "graph output was never computed"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{fixed_shape, AttrValue, DataType};

    #[test]
    fn test_evaluate_small_graph() {
        let mut graph = Graph::new("t");
        graph.add_input("x", DataType::Float, fixed_shape(&[1, 2, 2])).unwrap();
        graph.add_initializer("perm_src", TensorData::scalar_f32(3.0)).unwrap();
        graph
            .add_node(Node::new("mul", OpKind::Mul).with_inputs(&["x", "perm_src"]).with_outputs(&["y"]))
            .unwrap();
        graph
            .add_node(
                Node::new("t", OpKind::Transpose)
                    .with_inputs(&["y"])
                    .with_outputs(&["z"])
                    .with_attr("perm", AttrValue::Ints(vec![0, 2, 1])),
            )
            .unwrap();
        graph.add_output("z").unwrap();

        let mut feeds = BTreeMap::new();
        feeds.insert("x".to_string(), TensorData::from_f32(&[1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap());
        let out = evaluate(&graph, &feeds).unwrap();
        assert_eq!(out["z"].to_f32_vec(), Some(vec![3.0, 9.0, 6.0, 12.0]));
    }

    #[test]
    fn test_evaluate_rejects_wrong_input_shape() {
        let mut graph = Graph::new("t");
        graph.add_input("x", DataType::Float, fixed_shape(&[1, 4])).unwrap();
        graph
            .add_node(Node::new("id", OpKind::Identity).with_inputs(&["x"]).with_outputs(&["y"]))
            .unwrap();
        graph.add_output("y").unwrap();
        let mut feeds = BTreeMap::new();
        feeds.insert("x".to_string(), TensorData::f32_vec(&[1.0, 2.0]));
        assert!(matches!(evaluate(&graph, &feeds), Err(ExportError::InvalidOptions(_))));
    }

    #[test]
    fn test_shape_and_constant_of_shape() {
        let x = TensorData::from_f32(&[2, 3], vec![0.0; 6]).unwrap();
        let shape = eval_node(&Node::new("s", OpKind::Shape).with_outputs(&["s"]), &[Some(&x)]).unwrap();
        assert_eq!(shape[0].to_i64_vec(), Some(vec![2, 3]));
        let node = Node::new("c", OpKind::ConstantOfShape)
            .with_outputs(&["c"])
            .with_attr("value", AttrValue::Tensor(TensorData::f32_vec(&[1.0])));
        let ones = eval_node(&node, &[Some(&shape[0])]).unwrap();
        assert_eq!(ones[0].to_f32_vec(), Some(vec![1.0; 6]));
    }
}
