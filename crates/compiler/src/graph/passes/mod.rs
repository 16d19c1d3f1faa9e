// Optimization passes for export graphs
//
// This module contains individual optimization passes that can be
// composed and applied to graphs. Every pass only removes or rewrites
// nodes; none of them adds a node.

mod arithmetic;
mod constant_fold;
mod cse;
mod dce;
mod fusion;

pub use arithmetic::ArithmeticElimination;
pub use constant_fold::ConstantFolding;
pub use cse::CommonSubexpressionElimination;
pub use dce::DeadCodeElimination;
pub use fusion::OperatorFusion;

use super::ir::Graph;
use crate::Result;

/// Optimization pass trait
///
/// Each optimization pass implements this trait to provide a
/// composable transformation on the graph.
pub trait OptimizationPass {
    /// Get the name of this pass (for logging/debugging)
    fn name(&self) -> &str;

    /// Run the optimization pass on the graph
    ///
    /// Returns `true` if the graph was modified, `false` otherwise.
    /// This is used to determine when to stop fixpoint iteration.
    fn run(&self, graph: &mut Graph) -> Result<bool>;
}

/// Input tensors of a node that are constants, by slot
pub(crate) fn constant_inputs<'a>(graph: &'a Graph, inputs: &[String]) -> Option<Vec<Option<&'a super::TensorData>>> {
    inputs
        .iter()
        .map(|name| {
            if name.is_empty() {
                Some(None)
            } else {
                graph.initializer(name).map(Some)
            }
        })
        .collect()
}
