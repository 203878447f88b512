// Relu
//
// relu(x * s) == relu(x) * s for s > 0, so a zero-point free dequantization
// with positive scales moves after the activation.

use crate::error::Result;
use crate::graph::{LptGraph, NodeId, OpType};
use crate::low_precision::layer_transformation::{LayerParams, LayerTransformation, TransformationContext};
use crate::low_precision::network_helper::{get_dequantization, move_dequantization_after};

pub struct ReluTransformation {
    params: LayerParams,
}

impl ReluTransformation {
    pub fn new(params: LayerParams) -> Self {
        Self { params }
    }
}

impl LayerTransformation for ReluTransformation {
    fn name(&self) -> &str {
        "Relu"
    }

    fn matched_op(&self) -> OpType {
        OpType::Relu
    }

    fn params(&self) -> &LayerParams {
        &self.params
    }

    fn params_mut(&mut self) -> &mut LayerParams {
        &mut self.params
    }

    fn transform(&self, _ctx: &mut TransformationContext<'_>, graph: &mut LptGraph, node: NodeId) -> Result<bool> {
        let dequantization = get_dequantization(graph, node, 0);
        if dequantization.subtract.is_some() {
            return Ok(false);
        }
        let Some(scale) = dequantization.scale(graph) else {
            return Ok(false);
        };
        if scale.values().iter().any(|&v| v <= 0.0) {
            return Ok(false);
        }

        move_dequantization_after(graph, node, &dequantization, false, false)?;
        Ok(true)
    }

    fn is_precision_preserved(&self, _graph: &LptGraph, _node: NodeId) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ElementType, Op};
    use crate::low_precision::transformations::test_support::*;
    use crate::low_precision::TransformationRegistry;

    fn relu_after(graph: &mut LptGraph, shift: Option<f32>, scale: f32) -> (NodeId, NodeId, NodeId) {
        let shift = shift.map(|s| scalar(graph, s));
        let scale = scalar(graph, scale);
        let (q, deq) = dequantized(graph, "q", vec![1, 4], shift, scale);
        let relu = graph.add_op(Op::Relu).name("relu").inputs(&[deq]).finish().unwrap();
        let result = graph.add_op(Op::Result).inputs(&[relu]).finish().unwrap();
        (q, relu, result)
    }

    #[test]
    fn test_moves_positive_scale() {
        let mut graph = LptGraph::new();
        let (q, relu, result) = relu_after(&mut graph, None, 0.5);
        let values = feed(&[1, 4], vec![0.0, 3.0, 100.0, 255.0]);
        let before = run(&graph, &[(q, values.clone())]);

        let registry = TransformationRegistry::new();
        let mut ctx = TransformationContext::new(&registry);
        assert!(ReluTransformation::new(LayerParams::default())
            .transform(&mut ctx, &mut graph, relu)
            .unwrap());

        let tail = graph.input_node(result, 0).unwrap();
        assert_eq!(graph.name(tail), "relu_Multiply");
        let new_relu = graph.find_by_name("relu").unwrap();
        assert_eq!(graph.input_node(new_relu, 0), Some(q));
        assert_eq!(graph.element_type(new_relu), Some(ElementType::U8));

        let after = run(&graph, &[(q, values)]);
        assert_close(&before, &after);
    }

    #[test]
    fn test_declines_negative_scale_and_zero_point() {
        let registry = TransformationRegistry::new();
        let transformation = ReluTransformation::new(LayerParams::default());

        let mut graph = LptGraph::new();
        let (_, relu, _) = relu_after(&mut graph, None, -0.5);
        let mut ctx = TransformationContext::new(&registry);
        assert!(!transformation.transform(&mut ctx, &mut graph, relu).unwrap());

        let mut graph = LptGraph::new();
        let (_, relu, _) = relu_after(&mut graph, Some(128.0), 0.5);
        assert!(!transformation.transform(&mut ctx, &mut graph, relu).unwrap());
    }
}
