// Pooling
//
// Both poolings commute with a per-channel affine transform: MaxPool only
// while the scales are positive, AvgPool always. The whole chain, Subtract
// included, moves after the pooling.

use crate::error::Result;
use crate::graph::{LptGraph, NodeId, OpType};
use crate::low_precision::layer_transformation::{LayerParams, LayerTransformation, TransformationContext};
use crate::low_precision::network_helper::{get_dequantization, move_dequantization_after};

pub struct MaxPoolTransformation {
    params: LayerParams,
}

impl MaxPoolTransformation {
    pub fn new(params: LayerParams) -> Self {
        Self { params }
    }
}

impl LayerTransformation for MaxPoolTransformation {
    fn name(&self) -> &str {
        "MaxPool"
    }

    fn matched_op(&self) -> OpType {
        OpType::MaxPool
    }

    fn params(&self) -> &LayerParams {
        &self.params
    }

    fn params_mut(&mut self) -> &mut LayerParams {
        &mut self.params
    }

    fn transform(&self, _ctx: &mut TransformationContext<'_>, graph: &mut LptGraph, node: NodeId) -> Result<bool> {
        let dequantization = get_dequantization(graph, node, 0);
        let Some(scale) = dequantization.scale(graph) else {
            return Ok(false);
        };
        // max(x * s) == max(x) * s only for s > 0
        if scale.values().iter().any(|&v| v <= 0.0) {
            return Ok(false);
        }

        move_dequantization_after(graph, node, &dequantization, false, true)?;
        Ok(true)
    }

    fn is_precision_preserved(&self, _graph: &LptGraph, _node: NodeId) -> bool {
        true
    }
}

pub struct AvgPoolTransformation {
    params: LayerParams,
}

impl AvgPoolTransformation {
    pub fn new(params: LayerParams) -> Self {
        Self { params }
    }
}

impl LayerTransformation for AvgPoolTransformation {
    fn name(&self) -> &str {
        "AvgPool"
    }

    fn matched_op(&self) -> OpType {
        OpType::AvgPool
    }

    fn params(&self) -> &LayerParams {
        &self.params
    }

    fn params_mut(&mut self) -> &mut LayerParams {
        &mut self.params
    }

    fn transform(&self, _ctx: &mut TransformationContext<'_>, graph: &mut LptGraph, node: NodeId) -> Result<bool> {
        let dequantization = get_dequantization(graph, node, 0);
        if dequantization.multiply.is_none() {
            return Ok(false);
        }

        move_dequantization_after(graph, node, &dequantization, self.params.update_precisions, true)?;
        Ok(true)
    }

    fn is_precision_preserved(&self, _graph: &LptGraph, _node: NodeId) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LptError;
    use crate::graph::{ElementType, Op};
    use crate::low_precision::transformations::test_support::*;
    use crate::low_precision::TransformationRegistry;

    const SHAPE: [usize; 4] = [1, 2, 2, 2];

    fn input_values() -> Vec<f32> {
        vec![0.0, 10.0, 200.0, 255.0, 128.0, 1.0, 7.0, 64.0]
    }

    fn pooled(graph: &mut LptGraph, op: Op, relaxed: bool) -> (NodeId, NodeId, NodeId) {
        let shift = tensor(graph, &[1, 2, 1, 1], vec![128.0, 0.0]);
        let scale = tensor(graph, &[1, 2, 1, 1], vec![0.5, 0.25]);
        let (q, deq) = dequantized(graph, "q", SHAPE.to_vec(), Some(shift), scale);
        let mut builder = graph.add_op(op).name("pool").inputs(&[deq]);
        if relaxed {
            builder = builder.relaxed();
        }
        let pool = builder.finish().unwrap();
        let result = graph.add_op(Op::Result).inputs(&[pool]).finish().unwrap();
        (q, pool, result)
    }

    #[test]
    fn test_max_pool_moves_whole_chain() {
        let mut graph = LptGraph::new();
        let (q, pool, result) = pooled(&mut graph, Op::MaxPool { kernel: [2, 2] }, false);
        let before = run(&graph, &[(q, feed(&SHAPE, input_values()))]);

        let registry = TransformationRegistry::new();
        let mut ctx = TransformationContext::new(&registry);
        assert!(MaxPoolTransformation::new(LayerParams::default())
            .transform(&mut ctx, &mut graph, pool)
            .unwrap());

        let multiply = graph.input_node(result, 0).unwrap();
        assert_eq!(graph.name(multiply), "pool_Multiply");
        let subtract = graph.input_node(multiply, 0).unwrap();
        assert_eq!(graph.name(subtract), "pool_Subtract");

        let after = run(&graph, &[(q, feed(&SHAPE, input_values()))]);
        assert_close(&before, &after);
    }

    #[test]
    fn test_avg_pool_updates_precision() {
        let mut graph = LptGraph::new();
        let (q, pool, _) = pooled(&mut graph, Op::AvgPool { kernel: [2, 2] }, true);
        let before = run(&graph, &[(q, feed(&SHAPE, input_values()))]);

        let registry = TransformationRegistry::new();
        let mut ctx = TransformationContext::new(&registry);
        assert!(AvgPoolTransformation::new(LayerParams::default())
            .transform(&mut ctx, &mut graph, pool)
            .unwrap());

        let new_pool = graph.find_by_name("pool").unwrap();
        assert_eq!(graph.element_type(new_pool), Some(ElementType::U8));

        let after = run(&graph, &[(q, feed(&SHAPE, input_values()))]);
        assert_close(&before, &after);
    }

    #[test]
    fn test_avg_pool_requires_relaxed_node() {
        let mut graph = LptGraph::new();
        let (_, pool, _) = pooled(&mut graph, Op::AvgPool { kernel: [2, 2] }, false);

        let registry = TransformationRegistry::new();
        let mut ctx = TransformationContext::new(&registry);
        let err = AvgPoolTransformation::new(LayerParams::default())
            .transform(&mut ctx, &mut graph, pool)
            .unwrap_err();
        assert!(matches!(err, LptError::PrecisionOverrideUnsupported(_)));
    }
}
