// Arithmetic identity elimination
//
// Removes nodes that return one of their inputs unchanged:
// - Identity
// - x * 1, 1 * x, x + 0, 0 + x, x - 0, x / 1
// - Reshape to the input's own shape, Transpose by the identity permutation
// - Cast to the input's own element type
//
// A rewrite only fires when the surviving input already has the output's
// element type and shape, so broadcasting never changes. Nodes producing a
// graph output are kept so output names stay stable.

use super::OptimizationPass;
use crate::graph::{Graph, Node, OpKind};
use crate::runtime::transpose_perm;
use crate::Result;
use rustc_hash::FxHashSet;
use tracing::debug;

pub struct ArithmeticElimination;

impl ArithmeticElimination {
    pub fn new() -> Self {
        Self
    }

    /// Input that the node passes through unchanged, if any
    fn passthrough<'a>(&self, graph: &Graph, node: &'a Node) -> Option<&'a str> {
        let is_const = |name: &str, value: f64| graph.initializer(name).is_some_and(|t| t.all_equal(value));
        let candidate = match node.op {
            OpKind::Identity => node.input(0),
            OpKind::Mul => match (node.input(0)?, node.input(1)?) {
                (x, one) if is_const(one, 1.0) => Some(x),
                (one, x) if is_const(one, 1.0) => Some(x),
                _ => None,
            },
            OpKind::Add => match (node.input(0)?, node.input(1)?) {
                (x, zero) if is_const(zero, 0.0) => Some(x),
                (zero, x) if is_const(zero, 0.0) => Some(x),
                _ => None,
            },
            OpKind::Sub => match (node.input(0)?, node.input(1)?) {
                (x, zero) if is_const(zero, 0.0) => Some(x),
                _ => None,
            },
            OpKind::Div => match (node.input(0)?, node.input(1)?) {
                (x, one) if is_const(one, 1.0) => Some(x),
                _ => None,
            },
            OpKind::Reshape | OpKind::Cast => node.input(0),
            OpKind::Transpose => {
                let rank = graph.tensor_shape(node.input(0)?)?.len();
                let perm = transpose_perm(node, rank)?;
                perm.iter().enumerate().all(|(i, &p)| i == p).then(|| node.input(0)).flatten()
            }
            _ => None,
        }?;

        let output = node.outputs.first()?;
        let (src, dst) = (graph.tensor(candidate)?, graph.tensor(output)?);
        let src_shape = graph.symbols.resolve_shape(src.shape.as_ref()?);
        let dst_shape = graph.symbols.resolve_shape(dst.shape.as_ref()?);
        (src.dtype.is_some() && src.dtype == dst.dtype && src_shape == dst_shape).then_some(candidate)
    }
}

impl Default for ArithmeticElimination {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimizationPass for ArithmeticElimination {
    fn name(&self) -> &str {
        "ArithmeticElimination"
    }

    fn run(&self, graph: &mut Graph) -> Result<bool> {
        let mut rewires: Vec<(usize, String, String)> = Vec::new();
        for (index, node) in graph.nodes().iter().enumerate() {
            if node.outputs.len() != 1 || graph.is_graph_output(&node.outputs[0]) {
                continue;
            }
            if let Some(source) = self.passthrough(graph, node) {
                rewires.push((index, node.outputs[0].clone(), source.to_string()));
            }
        }
        if rewires.is_empty() {
            return Ok(false);
        }

        let mut removed = FxHashSet::default();
        for (index, output, source) in rewires {
            // A passthrough whose source was itself rewired is caught next round
            if removed.iter().any(|&r: &usize| graph.nodes()[r].outputs.contains(&source)) {
                continue;
            }
            graph.replace_all_uses(&output, &source);
            removed.insert(index);
        }
        debug!("Eliminated {} identity operations", removed.len());
        graph.remove_nodes(&removed);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{fixed_shape, AttrValue, DataType, TensorData, TensorInfo};

    fn typed(graph: &mut Graph, name: &str, dims: &[i64]) {
        graph.set_tensor_info(name, TensorInfo::new(DataType::Float, fixed_shape(dims)));
    }

    #[test]
    fn test_removes_multiply_by_one() {
        let mut graph = Graph::new("t");
        graph.add_input("x", DataType::Float, fixed_shape(&[1, 4])).unwrap();
        graph.add_initializer("one", TensorData::scalar_f32(1.0)).unwrap();
        graph
            .add_node(Node::new("mul", OpKind::Mul).with_inputs(&["one", "x"]).with_outputs(&["m"]))
            .unwrap();
        graph
            .add_node(Node::new("sig", OpKind::Sigmoid).with_inputs(&["m"]).with_outputs(&["y"]))
            .unwrap();
        graph.add_output("y").unwrap();
        typed(&mut graph, "m", &[1, 4]);
        typed(&mut graph, "y", &[1, 4]);

        assert!(ArithmeticElimination::new().run(&mut graph).unwrap());
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.nodes()[0].inputs, vec!["x".to_string()]);
    }

    #[test]
    fn test_keeps_broadcasting_add() {
        let mut graph = Graph::new("t");
        graph.add_input("x", DataType::Float, fixed_shape(&[4])).unwrap();
        graph
            .add_initializer("zeros", TensorData::from_f32(&[2, 4], vec![0.0; 8]).unwrap())
            .unwrap();
        graph
            .add_node(Node::new("add", OpKind::Add).with_inputs(&["x", "zeros"]).with_outputs(&["a"]))
            .unwrap();
        graph
            .add_node(Node::new("sig", OpKind::Sigmoid).with_inputs(&["a"]).with_outputs(&["y"]))
            .unwrap();
        graph.add_output("y").unwrap();
        typed(&mut graph, "a", &[2, 4]);
        assert!(!ArithmeticElimination::new().run(&mut graph).unwrap());
    }

    #[test]
    fn test_removes_identity_transpose_but_not_graph_output() {
        let mut graph = Graph::new("t");
        graph.add_input("x", DataType::Float, fixed_shape(&[2, 3])).unwrap();
        graph
            .add_node(
                Node::new("t", OpKind::Transpose)
                    .with_inputs(&["x"])
                    .with_outputs(&["t"])
                    .with_attr("perm", AttrValue::Ints(vec![0, 1])),
            )
            .unwrap();
        graph
            .add_node(Node::new("id", OpKind::Identity).with_inputs(&["t"]).with_outputs(&["y"]))
            .unwrap();
        graph.add_output("y").unwrap();
        typed(&mut graph, "t", &[2, 3]);
        typed(&mut graph, "y", &[2, 3]);

        assert!(ArithmeticElimination::new().run(&mut graph).unwrap());
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.nodes()[0].op, OpKind::Identity);
        assert!(!ArithmeticElimination::new().run(&mut graph).unwrap());
    }
}
