// Graph module for the detection exporter
//
// This module provides the intermediate representation that every pipeline
// stage reads and rewrites:
// - Tensor shapes with interned symbolic dimensions
// - Constant tensor data and element types
// - The closed operator set of the target opset
// - Optimization passes and the fixpoint driver used by the simplifier

pub mod ir;
pub mod ops;
pub mod optimizer;
pub mod passes;
pub mod shape;
pub mod tensor;

// Re-exports for convenience
pub use ir::{AttrValue, Graph, GraphStatistics, Node, TensorInfo};
pub use ops::OpKind;
pub use optimizer::{GraphOptimizer, OptimizationStats, PassStats};
pub use passes::OptimizationPass;
pub use shape::{concrete_dims, fixed_shape, Dim, Shape, SymExpr, SymbolId, SymbolOrigin, SymbolTable};
pub use tensor::{DataType, TensorData};
