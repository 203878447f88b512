//! Concat subgraph discovery
//!
//! Collects the Concats reachable through Concat-to-Concat and
//! Concat-to-FakeQuantize edges, the FakeQuantize producers feeding them and
//! the pooling layers in between. Anything else on a Concat input makes the
//! subgraph unsupported.

use super::layer_transformation::TransformationContext;
use crate::error::{LptError, Result};
use crate::graph::{LptGraph, NodeId, OpType};
use rustc_hash::FxHashSet;

/// Layers allowed between a FakeQuantize and a Concat
const INTERMEDIATE_TYPES: [OpType; 2] = [OpType::AvgPool, OpType::MaxPool];

enum Visit {
    Concat(NodeId),
    Parent(NodeId),
    Children(NodeId),
}

/// Jointly quantized FakeQuantize producers and Concat consumers
#[derive(Debug, Clone, Default)]
pub struct Subgraph {
    pub quantization_layers: Vec<NodeId>,
    pub concat_layers: Vec<NodeId>,
    /// All members in discovery order: FakeQuantizes, Concats and intermediates
    pub layers: Vec<NodeId>,
    members: FxHashSet<NodeId>,
}

impl Subgraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.members.contains(&node)
    }

    /// Collect the subgraph around `concat`
    ///
    /// Fails with the recoverable [`LptError::Subgraph`] when a Concat input
    /// cannot be part of a jointly quantized subgraph.
    pub fn fill_subgraph_for_concat(
        &mut self,
        ctx: &TransformationContext<'_>,
        graph: &LptGraph,
        concat: NodeId,
    ) -> Result<()> {
        let mut stack = vec![Visit::Concat(concat)];

        while let Some(visit) = stack.pop() {
            match visit {
                Visit::Concat(node) => {
                    if !self.insert(node) {
                        continue;
                    }
                    self.concat_layers.push(node);
                    stack.push(Visit::Children(node));
                    for (parent, _) in graph.inputs(node).into_iter().rev() {
                        stack.push(Visit::Parent(parent));
                    }
                }
                Visit::Parent(node) => {
                    if self.contains(node) {
                        continue;
                    }
                    match graph.op_type(node) {
                        Some(OpType::FakeQuantize) => {
                            self.insert(node);
                            self.quantization_layers.push(node);
                            stack.push(Visit::Children(node));
                        }
                        Some(OpType::Concat) => stack.push(Visit::Concat(node)),
                        Some(op_type)
                            if INTERMEDIATE_TYPES.contains(&op_type) && ctx.is_precision_preserved(graph, node) =>
                        {
                            self.insert(node);
                            stack.push(Visit::Children(node));
                            let parent = graph.input_node(node, 0).ok_or_else(|| {
                                LptError::Subgraph(format!("{} has no data input", graph.name(node)))
                            })?;
                            stack.push(Visit::Parent(parent));
                        }
                        op_type => {
                            return Err(LptError::Subgraph(format!(
                                "{} ({}) cannot feed a quantized Concat",
                                graph.name(node),
                                op_type.map(|t| t.name()).unwrap_or("removed")
                            )));
                        }
                    }
                }
                Visit::Children(node) => {
                    for child in graph.consumer_nodes(node) {
                        if !self.contains(child) && graph.is_op(child, OpType::Concat) {
                            stack.push(Visit::Concat(child));
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Swap a member for its replacement, keeping its position
    pub fn replace(&mut self, old: NodeId, new: NodeId) {
        if !self.members.remove(&old) {
            return;
        }
        self.members.insert(new);
        for list in [&mut self.quantization_layers, &mut self.concat_layers, &mut self.layers] {
            for node in list.iter_mut().filter(|n| **n == old) {
                *node = new;
            }
        }
    }

    fn insert(&mut self, node: NodeId) -> bool {
        if self.members.insert(node) {
            self.layers.push(node);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ElementType, Op, Tensor};
    use crate::low_precision::{LayerParams, TransformationRegistry};

    fn fake_quantize(graph: &mut LptGraph, name: &str) -> NodeId {
        let input = graph
            .add_op(Op::Parameter)
            .output(ElementType::F32, vec![1, 2, 4, 4])
            .finish()
            .unwrap();
        let low = graph
            .add_op(Op::Constant(Tensor::scalar(ElementType::F32, 0.0)))
            .finish()
            .unwrap();
        let high = graph
            .add_op(Op::Constant(Tensor::scalar(ElementType::F32, 2.55)))
            .finish()
            .unwrap();
        graph
            .add_op(Op::FakeQuantize { levels: 256 })
            .name(name)
            .inputs(&[input, low, high, low, high])
            .finish()
            .unwrap()
    }

    #[test]
    fn test_collects_nested_concats_and_pooling() {
        let registry = TransformationRegistry::all(LayerParams::default());
        let ctx = TransformationContext::new(&registry);
        let mut graph = LptGraph::new();

        let fq1 = fake_quantize(&mut graph, "fq1");
        let fq2 = fake_quantize(&mut graph, "fq2");
        let fq3 = fake_quantize(&mut graph, "fq3");
        let pool = graph
            .add_op(Op::MaxPool { kernel: [1, 1] })
            .inputs(&[fq2])
            .finish()
            .unwrap();
        let concat1 = graph.add_op(Op::Concat { axis: 1 }).inputs(&[fq1, pool]).finish().unwrap();
        let concat2 = graph
            .add_op(Op::Concat { axis: 1 })
            .inputs(&[concat1, fq3])
            .finish()
            .unwrap();
        // fq3 also feeds a second concat
        let concat3 = graph.add_op(Op::Concat { axis: 1 }).inputs(&[fq3, fq1]).finish().unwrap();

        let mut subgraph = Subgraph::new();
        subgraph.fill_subgraph_for_concat(&ctx, &graph, concat1).unwrap();

        assert_eq!(subgraph.quantization_layers.len(), 3);
        assert_eq!(subgraph.concat_layers.len(), 3);
        for node in [fq1, fq2, fq3, pool, concat1, concat2, concat3] {
            assert!(subgraph.contains(node));
        }
    }

    #[test]
    fn test_unsupported_parent_is_recoverable() {
        let registry = TransformationRegistry::all(LayerParams::default());
        let ctx = TransformationContext::new(&registry);
        let mut graph = LptGraph::new();

        let fq = fake_quantize(&mut graph, "fq");
        let plain = graph
            .add_op(Op::Parameter)
            .output(ElementType::F32, vec![1, 2, 4, 4])
            .finish()
            .unwrap();
        let concat = graph.add_op(Op::Concat { axis: 1 }).inputs(&[fq, plain]).finish().unwrap();

        let err = Subgraph::new().fill_subgraph_for_concat(&ctx, &graph, concat).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_replace_member() {
        let mut graph = LptGraph::new();
        let registry = TransformationRegistry::new();
        let ctx = TransformationContext::new(&registry);
        let fq = fake_quantize(&mut graph, "fq");
        let other = fake_quantize(&mut graph, "other");
        let concat = graph.add_op(Op::Concat { axis: 1 }).inputs(&[fq, fq]).finish().unwrap();

        let mut subgraph = Subgraph::new();
        subgraph.fill_subgraph_for_concat(&ctx, &graph, concat).unwrap();
        subgraph.replace(fq, other);

        assert!(subgraph.contains(other));
        assert!(!subgraph.contains(fq));
        assert_eq!(subgraph.quantization_layers, vec![other]);
    }
}
