// Dead code elimination
//
// Walks the node list backwards from the graph outputs and removes nodes
// none of whose outputs are needed, then drops initializers and tensor
// metadata nothing references anymore.

use super::OptimizationPass;
use crate::graph::Graph;
use crate::Result;
use rustc_hash::FxHashSet;
use tracing::debug;

pub struct DeadCodeElimination;

impl DeadCodeElimination {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DeadCodeElimination {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimizationPass for DeadCodeElimination {
    fn name(&self) -> &str {
        "DeadCodeElimination"
    }

    fn run(&self, graph: &mut Graph) -> Result<bool> {
        let mut live: FxHashSet<String> = graph.outputs().iter().cloned().collect();
        let mut dead = FxHashSet::default();
        for (index, node) in graph.nodes().iter().enumerate().rev() {
            if node.outputs.iter().any(|o| live.contains(o)) {
                live.extend(node.inputs.iter().filter(|i| !i.is_empty()).cloned());
            } else {
                dead.insert(index);
            }
        }

        let unused: Vec<String> = graph
            .initializers()
            .keys()
            .filter(|name| !live.contains(*name))
            .cloned()
            .collect();

        let changed = !dead.is_empty() || !unused.is_empty();
        if !dead.is_empty() {
            debug!("Removing {} dead nodes", dead.len());
            graph.remove_nodes(&dead);
        }
        for name in &unused {
            graph.remove_initializer(name);
        }
        let pruned = graph.prune_tensor_infos();
        Ok(changed || pruned > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{fixed_shape, DataType, Node, OpKind, TensorData};

    #[test]
    fn test_removes_unreachable_nodes_and_initializers() {
        let mut graph = Graph::new("t");
        graph.add_input("x", DataType::Float, fixed_shape(&[2])).unwrap();
        graph.add_initializer("unused", TensorData::f32_vec(&[1.0])).unwrap();
        graph
            .add_node(Node::new("sig", OpKind::Sigmoid).with_inputs(&["x"]).with_outputs(&["y"]))
            .unwrap();
        graph
            .add_node(Node::new("dead", OpKind::Sigmoid).with_inputs(&["x"]).with_outputs(&["z"]))
            .unwrap();
        graph.add_output("y").unwrap();

        assert!(DeadCodeElimination::new().run(&mut graph).unwrap());
        assert_eq!(graph.node_count(), 1);
        assert!(graph.initializer("unused").is_none());
        assert!(graph.tensor("z").is_none());
        assert!(!DeadCodeElimination::new().run(&mut graph).unwrap());
    }

    #[test]
    fn test_keeps_multi_output_node_with_one_live_output() {
        let mut graph = Graph::new("t");
        graph.add_input("x", DataType::Float, fixed_shape(&[4])).unwrap();
        graph
            .add_node(Node::new("split", OpKind::Split).with_inputs(&["x"]).with_outputs(&["a", "b"]))
            .unwrap();
        graph.add_output("b").unwrap();
        assert!(!DeadCodeElimination::new().run(&mut graph).unwrap());
        assert_eq!(graph.node_count(), 1);
    }
}
