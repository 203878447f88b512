// Add
//
// A dequantized input plus a constant: `x * a + b` becomes `(x + b / a) * a`
// so the scale keeps moving down the graph.

use crate::error::Result;
use crate::graph::{LptGraph, NodeId, OpType};
use crate::low_precision::layer_transformation::{LayerParams, LayerTransformation, TransformationContext};
use crate::low_precision::network_helper::{binary_constant, get_dequantization, swap_multiply_and_add};

pub struct AddTransformation {
    params: LayerParams,
}

impl AddTransformation {
    pub fn new(params: LayerParams) -> Self {
        Self { params }
    }
}

impl LayerTransformation for AddTransformation {
    fn name(&self) -> &str {
        "Add"
    }

    fn matched_op(&self) -> OpType {
        OpType::Add
    }

    fn params(&self) -> &LayerParams {
        &self.params
    }

    fn params_mut(&mut self) -> &mut LayerParams {
        &mut self.params
    }

    fn transform(&self, _ctx: &mut TransformationContext<'_>, graph: &mut LptGraph, node: NodeId) -> Result<bool> {
        let Some((data_slot, _)) = binary_constant(graph, node) else {
            return Ok(false);
        };
        let dequantization = get_dequantization(graph, node, data_slot);
        let Some(multiply) = dequantization.multiply else {
            return Ok(false);
        };
        if graph.consumer_count(multiply) != 1 {
            return Ok(false);
        }
        // b / a needs a scale without zeros
        let invertible = dequantization
            .scale(graph)
            .map(|scale| scale.values().iter().all(|&v| v != 0.0))
            .unwrap_or(false);
        if !invertible {
            return Ok(false);
        }

        swap_multiply_and_add(graph, node, data_slot)?;
        Ok(true)
    }

    fn is_precision_preserved(&self, _graph: &LptGraph, _node: NodeId) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Op;
    use crate::low_precision::transformations::test_support::*;
    use crate::low_precision::TransformationRegistry;

    fn biased(graph: &mut LptGraph, scale: f32) -> (NodeId, NodeId, NodeId) {
        let scale = scalar(graph, scale);
        let shift = scalar(graph, 10.0);
        let (q, deq) = dequantized(graph, "q", vec![1, 3], Some(shift), scale);
        let bias = tensor(graph, &[1, 3], vec![1.0, -2.0, 0.5]);
        let add = graph.add_op(Op::Add).name("add").inputs(&[deq, bias]).finish().unwrap();
        let result = graph.add_op(Op::Result).inputs(&[add]).finish().unwrap();
        (q, add, result)
    }

    #[test]
    fn test_swaps_scale_below_bias() {
        let mut graph = LptGraph::new();
        let (q, add, result) = biased(&mut graph, 0.25);
        let values = feed(&[1, 3], vec![0.0, 10.0, 200.0]);
        let before = run(&graph, &[(q, values.clone())]);

        let registry = TransformationRegistry::new();
        let mut ctx = TransformationContext::new(&registry);
        assert!(AddTransformation::new(LayerParams::default())
            .transform(&mut ctx, &mut graph, add)
            .unwrap());

        let tail = graph.input_node(result, 0).unwrap();
        assert_eq!(graph.name(tail), "add_Multiply");
        let new_add = graph.input_node(tail, 0).unwrap();
        assert_eq!(graph.name(new_add), "add");
        let bias = graph.constant(graph.input_node(new_add, 1).unwrap()).unwrap();
        assert_eq!(bias.to_vec(), vec![4.0, -8.0, 2.0]);

        let after = run(&graph, &[(q, values)]);
        assert_close(&before, &after);
    }

    #[test]
    fn test_declines_zero_scale() {
        let mut graph = LptGraph::new();
        let (_, add, _) = biased(&mut graph, 0.0);

        let registry = TransformationRegistry::new();
        let mut ctx = TransformationContext::new(&registry);
        assert!(!AddTransformation::new(LayerParams::default())
            .transform(&mut ctx, &mut graph, add)
            .unwrap());
    }
}
