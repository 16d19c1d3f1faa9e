// Common subexpression elimination
//
// Two nodes with the same operator, inputs and attributes compute the same
// values; the later one is removed and its consumers rewired to the earlier
// one. Small initializers with identical contents are merged the same way.

use super::OptimizationPass;
use crate::graph::{Graph, OpKind};
use crate::Result;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

/// Initializers above this size are never compared byte-wise
const MAX_DEDUP_ELEMENTS: usize = 4096;

pub struct CommonSubexpressionElimination;

impl CommonSubexpressionElimination {
    pub fn new() -> Self {
        Self
    }

    fn merge_initializers(&self, graph: &mut Graph) -> usize {
        let mut seen: FxHashMap<(i32, Vec<usize>, Vec<u8>), String> = FxHashMap::default();
        let mut renames = Vec::new();
        for (name, data) in graph.initializers() {
            if data.len() > MAX_DEDUP_ELEMENTS || graph.is_graph_output(name) {
                continue;
            }
            let key = (data.dtype().onnx_code(), data.shape().to_vec(), data.to_le_bytes());
            match seen.get(&key) {
                Some(first) => renames.push((name.clone(), first.clone())),
                None => {
                    seen.insert(key, name.clone());
                }
            }
        }
        let mut merged = 0;
        for (duplicate, first) in renames {
            if graph.use_count(&duplicate) > 0 {
                graph.replace_all_uses(&duplicate, &first);
                merged += 1;
            }
        }
        merged
    }
}

impl Default for CommonSubexpressionElimination {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimizationPass for CommonSubexpressionElimination {
    fn name(&self) -> &str {
        "CommonSubexpressionElimination"
    }

    fn run(&self, graph: &mut Graph) -> Result<bool> {
        let merged_constants = self.merge_initializers(graph);

        let mut by_key: FxHashMap<(OpKind, Vec<String>), Vec<usize>> = FxHashMap::default();
        let mut duplicates: Vec<(usize, usize)> = Vec::new();
        for (index, node) in graph.nodes().iter().enumerate() {
            let candidates = by_key.entry((node.op, node.inputs.clone())).or_default();
            let twin = candidates.iter().copied().find(|&earlier| {
                let other = &graph.nodes()[earlier];
                other.attributes == node.attributes && other.outputs.len() == node.outputs.len()
            });
            let renames_output = node.outputs.iter().any(|o| graph.is_graph_output(o));
            match twin {
                Some(earlier) if !renames_output => duplicates.push((index, earlier)),
                _ => candidates.push(index),
            }
        }

        if duplicates.is_empty() {
            return Ok(merged_constants > 0);
        }

        let mut removed = FxHashSet::default();
        for (index, earlier) in duplicates {
            let pairs: Vec<(String, String)> = graph.nodes()[index]
                .outputs
                .iter()
                .cloned()
                .zip(graph.nodes()[earlier].outputs.iter().cloned())
                .collect();
            for (old, new) in pairs {
                graph.replace_all_uses(&old, &new);
            }
            removed.insert(index);
        }
        debug!("Eliminated {} duplicate nodes", removed.len());
        graph.remove_nodes(&removed);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{fixed_shape, DataType, Node, TensorData};

    #[test]
    fn test_merges_identical_nodes() {
        let mut graph = Graph::new("t");
        graph.add_input("x", DataType::Float, fixed_shape(&[2])).unwrap();
        graph
            .add_node(Node::new("a", OpKind::Sigmoid).with_inputs(&["x"]).with_outputs(&["a"]))
            .unwrap();
        graph
            .add_node(Node::new("b", OpKind::Sigmoid).with_inputs(&["x"]).with_outputs(&["b"]))
            .unwrap();
        graph
            .add_node(Node::new("sum", OpKind::Add).with_inputs(&["a", "b"]).with_outputs(&["y"]))
            .unwrap();
        graph.add_output("y").unwrap();

        assert!(CommonSubexpressionElimination::new().run(&mut graph).unwrap());
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.nodes()[1].inputs, vec!["a".to_string(), "a".to_string()]);
        assert!(graph.validate_dag().is_ok());
        assert!(!CommonSubexpressionElimination::new().run(&mut graph).unwrap());
    }

    #[test]
    fn test_merges_equal_constants() {
        let mut graph = Graph::new("t");
        graph.add_input("x", DataType::Float, fixed_shape(&[2])).unwrap();
        graph.add_initializer("c0", TensorData::scalar_f32(0.5)).unwrap();
        graph.add_initializer("c1", TensorData::scalar_f32(0.5)).unwrap();
        graph
            .add_node(Node::new("m0", OpKind::Mul).with_inputs(&["x", "c0"]).with_outputs(&["a"]))
            .unwrap();
        graph
            .add_node(Node::new("m1", OpKind::Mul).with_inputs(&["x", "c1"]).with_outputs(&["b"]))
            .unwrap();
        graph
            .add_node(Node::new("sum", OpKind::Add).with_inputs(&["a", "b"]).with_outputs(&["y"]))
            .unwrap();
        graph.add_output("y").unwrap();

        let pass = CommonSubexpressionElimination::new();
        assert!(pass.run(&mut graph).unwrap());
        // Second round sees the now-identical multiplies
        assert!(pass.run(&mut graph).unwrap());
        assert_eq!(graph.node_count(), 2);
    }

    #[test]
    fn test_keeps_nodes_with_different_attributes() {
        let mut graph = Graph::new("t");
        graph.add_input("x", DataType::Float, fixed_shape(&[2, 2])).unwrap();
        for (name, axis) in [("s0", 0), ("s1", 1)] {
            graph
                .add_node(
                    Node::new(name, OpKind::Softmax)
                        .with_inputs(&["x"])
                        .with_outputs(&[name])
                        .with_attr("axis", crate::graph::AttrValue::Int(axis)),
                )
                .unwrap();
        }
        graph
            .add_node(Node::new("sum", OpKind::Add).with_inputs(&["s0", "s1"]).with_outputs(&["y"]))
            .unwrap();
        graph.add_output("y").unwrap();
        assert!(!CommonSubexpressionElimination::new().run(&mut graph).unwrap());
    }
}
