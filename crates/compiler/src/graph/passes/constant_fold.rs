// Constant folding
//
// A node whose inputs are all initializers is evaluated with the reference
// runtime and replaced by initializers holding its outputs. `Shape` of a
// tensor with a fully concrete shape folds even when the tensor itself is
// computed at runtime; this is what collapses anchor generation in static
// exports.

use super::{constant_inputs, OptimizationPass};
use crate::graph::{Graph, OpKind, TensorData};
use crate::runtime::eval_node;
use crate::Result;
use rustc_hash::FxHashSet;
use tracing::debug;

/// Upper bound on the number of elements a folded tensor may hold
const DEFAULT_MAX_ELEMENTS: usize = 1 << 22;

pub struct ConstantFolding {
    max_elements: usize,
}

impl ConstantFolding {
    pub fn new() -> Self {
        Self {
            max_elements: DEFAULT_MAX_ELEMENTS,
        }
    }

    pub fn with_max_elements(mut self, max_elements: usize) -> Self {
        self.max_elements = max_elements;
        self
    }

    fn fold(&self, graph: &Graph, index: usize) -> Option<Vec<TensorData>> {
        let node = graph.node(index)?;
        if !node.op.is_foldable() || node.outputs.iter().any(|o| graph.is_graph_output(o)) {
            return None;
        }

        if node.op == OpKind::Shape {
            let input = node.input(0)?;
            if !graph.is_initializer(input) {
                return graph
                    .concrete_shape(input)
                    .map(|dims| vec![TensorData::i64_vec(&dims)]);
            }
        }

        let inputs = constant_inputs(graph, &node.inputs)?;
        match eval_node(node, &inputs) {
            Ok(outputs) if outputs.len() == node.outputs.len() => Some(outputs),
            Ok(_) => None,
            Err(e) => {
                debug!("Not folding {}: {}", node.name, e);
                None
            }
        }
    }
}

impl Default for ConstantFolding {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimizationPass for ConstantFolding {
    fn name(&self) -> &str {
        "ConstantFolding"
    }

    fn run(&self, graph: &mut Graph) -> Result<bool> {
        let mut folded = FxHashSet::default();
        for index in 0..graph.node_count() {
            let Some(outputs) = self.fold(graph, index) else {
                continue;
            };
            if outputs.iter().any(|t| t.len() > self.max_elements) {
                continue;
            }
            let names = graph.nodes()[index].outputs.clone();
            for (name, data) in names.iter().zip(outputs) {
                graph.set_initializer(name, data);
            }
            folded.insert(index);
        }

        if folded.is_empty() {
            return Ok(false);
        }
        debug!("Folded {} constant nodes", folded.len());
        graph.remove_nodes(&folded);
        Ok(true)
    }
}
