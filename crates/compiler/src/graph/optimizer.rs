// Graph optimizer: runs optimization passes to a fixed point
//
// Each iteration applies every pass once in order. Iteration stops when a
// full round leaves the graph unchanged, which makes the result idempotent:
// optimizing an already optimized graph performs one round and returns it
// untouched.

use super::ir::Graph;
use super::passes::{
    ArithmeticElimination, CommonSubexpressionElimination, ConstantFolding, DeadCodeElimination, OperatorFusion,
    OptimizationPass,
};
use crate::Result;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default bound on fixpoint rounds
const DEFAULT_MAX_ITERATIONS: usize = 64;

/// Per-pass counters accumulated across iterations
#[derive(Debug, Clone, Default)]
pub struct PassStats {
    pub name: String,
    /// Rounds in which the pass changed the graph
    pub changes: usize,
    pub time: Duration,
}

/// Summary of an optimizer run
#[derive(Debug, Clone, Default)]
pub struct OptimizationStats {
    pub original_nodes: usize,
    pub optimized_nodes: usize,
    pub original_initializers: usize,
    pub optimized_initializers: usize,
    pub iterations: usize,
    /// False when the iteration bound was hit before a fixed point
    pub converged: bool,
    pub passes: Vec<PassStats>,
}

impl OptimizationStats {
    pub fn nodes_removed(&self) -> usize {
        self.original_nodes.saturating_sub(self.optimized_nodes)
    }
}

impl fmt::Display for OptimizationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} -> {} nodes, {} -> {} initializers in {} iterations",
            self.original_nodes,
            self.optimized_nodes,
            self.original_initializers,
            self.optimized_initializers,
            self.iterations
        )?;
        for pass in &self.passes {
            writeln!(f, "  {:<32} {:>4} changes  {:?}", pass.name, pass.changes, pass.time)?;
        }
        Ok(())
    }
}

/// Fixpoint driver over a list of passes
pub struct GraphOptimizer {
    passes: Vec<Box<dyn OptimizationPass>>,
    max_iterations: usize,
}

impl GraphOptimizer {
    /// Optimizer with the standard pass pipeline
    pub fn new() -> Self {
        Self {
            passes: vec![
                Box::new(ConstantFolding::new()),
                Box::new(ArithmeticElimination::new()),
                Box::new(OperatorFusion::new()),
                Box::new(CommonSubexpressionElimination::new()),
                Box::new(DeadCodeElimination::new()),
            ],
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    /// Optimizer with a caller-chosen pass list
    pub fn with_passes(passes: Vec<Box<dyn OptimizationPass>>) -> Self {
        Self {
            passes,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Run all passes until none of them changes the graph
    pub fn optimize(&self, graph: &mut Graph) -> Result<OptimizationStats> {
        let mut stats = OptimizationStats {
            original_nodes: graph.node_count(),
            original_initializers: graph.initializers().len(),
            passes: self
                .passes
                .iter()
                .map(|p| PassStats {
                    name: p.name().to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        while stats.iterations < self.max_iterations {
            stats.iterations += 1;
            let mut changed = false;
            for (pass, pass_stats) in self.passes.iter().zip(stats.passes.iter_mut()) {
                let before = graph.node_count();
                let start = Instant::now();
                let modified = pass.run(graph)?;
                pass_stats.time += start.elapsed();
                if modified {
                    pass_stats.changes += 1;
                    changed = true;
                    debug!(
                        "Iteration {}: {} modified graph ({} -> {} nodes)",
                        stats.iterations,
                        pass.name(),
                        before,
                        graph.node_count()
                    );
                }
            }
            if !changed {
                stats.converged = true;
                break;
            }
        }

        if !stats.converged {
            warn!("Optimizer stopped after {} iterations without reaching a fixed point", self.max_iterations);
        }

        stats.optimized_nodes = graph.node_count();
        stats.optimized_initializers = graph.initializers().len();
        info!(
            "Optimized graph: {} -> {} nodes ({} iterations)",
            stats.original_nodes, stats.optimized_nodes, stats.iterations
        );
        Ok(stats)
    }
}

impl Default for GraphOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{fixed_shape, DataType, Node, OpKind, TensorData, TensorInfo};

    fn redundant_graph() -> Graph {
        let mut graph = Graph::new("t");
        graph.add_input("x", DataType::Float, fixed_shape(&[1, 4])).unwrap();
        graph.add_initializer("one", TensorData::scalar_f32(1.0)).unwrap();
        graph.add_initializer("a", TensorData::scalar_f32(2.0)).unwrap();
        graph
            .add_node(Node::new("k", OpKind::Add).with_inputs(&["a", "a"]).with_outputs(&["k"]))
            .unwrap();
        graph
            .add_node(Node::new("m", OpKind::Mul).with_inputs(&["x", "one"]).with_outputs(&["m"]))
            .unwrap();
        graph
            .add_node(Node::new("s0", OpKind::Sigmoid).with_inputs(&["m"]).with_outputs(&["s0"]))
            .unwrap();
        graph
            .add_node(Node::new("s1", OpKind::Sigmoid).with_inputs(&["m"]).with_outputs(&["s1"]))
            .unwrap();
        graph
            .add_node(Node::new("sum", OpKind::Add).with_inputs(&["s0", "s1"]).with_outputs(&["t"]))
            .unwrap();
        graph
            .add_node(Node::new("out", OpKind::Mul).with_inputs(&["t", "k"]).with_outputs(&["y"]))
            .unwrap();
        graph
            .add_node(Node::new("dead", OpKind::Sigmoid).with_inputs(&["x"]).with_outputs(&["d"]))
            .unwrap();
        graph.add_output("y").unwrap();
        for name in ["m", "s0", "s1", "t", "y", "d"] {
            graph.set_tensor_info(name, TensorInfo::new(DataType::Float, fixed_shape(&[1, 4])));
        }
        graph
    }

    #[test]
    fn test_reaches_fixed_point() {
        let mut graph = redundant_graph();
        let stats = GraphOptimizer::new().optimize(&mut graph).unwrap();
        assert!(stats.converged);
        // Sigmoid, Add, Mul remain
        assert_eq!(graph.node_count(), 3);
        assert_eq!(stats.nodes_removed(), 4);
        assert!(graph.validate_dag().is_ok());
    }

    #[test]
    fn test_second_run_is_a_no_op() {
        let mut graph = redundant_graph();
        GraphOptimizer::new().optimize(&mut graph).unwrap();
        let snapshot = graph.clone();
        let stats = GraphOptimizer::new().optimize(&mut graph).unwrap();
        assert_eq!(stats.iterations, 1);
        assert_eq!(graph, snapshot);
    }

    #[test]
    fn test_display_lists_passes() {
        let mut graph = redundant_graph();
        let stats = GraphOptimizer::new().optimize(&mut graph).unwrap();
        let text = stats.to_string();
        assert!(text.contains("ConstantFolding"));
        assert!(text.contains("DeadCodeElimination"));
    }
}
