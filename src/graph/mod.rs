// Graph module for Hologram low-precision transformations
//
// Minimal intermediate representation the transformations operate on:
// - Arena graph with stable node handles and slot-annotated data edges
// - Constant tensors and elementary constant folding
// - Local type/shape inference on node creation
// - A reference evaluator for checking numeric equivalence of rewrites

pub mod eval;
pub mod fold;
pub mod ir;
pub mod tensor;

// Re-exports for convenience
pub use ir::{Dependency, GraphNode, GraphStatistics, LptGraph, NewOp, NodeId, Op, OpType, Output};
pub use tensor::{ElementType, Tensor};
