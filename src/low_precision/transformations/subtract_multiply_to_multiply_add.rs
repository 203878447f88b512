// Subtract-Multiply to Multiply-Add
//
// (x - zp) * s becomes x * s + (-zp * s), which maps onto a fused
// multiply-add.

use crate::error::Result;
use crate::graph::fold::fold_multiply;
use crate::graph::{LptGraph, NodeId, Op, OpType, Tensor};
use crate::low_precision::layer_transformation::{LayerParams, LayerTransformation, TransformationContext};
use crate::low_precision::network_helper::binary_constant;
use tracing::debug;

pub struct SubtractMultiplyToMultiplyAddTransformation {
    params: LayerParams,
}

impl SubtractMultiplyToMultiplyAddTransformation {
    pub fn new(params: LayerParams) -> Self {
        Self { params }
    }
}

impl LayerTransformation for SubtractMultiplyToMultiplyAddTransformation {
    fn name(&self) -> &str {
        "SubtractMultiplyToMultiplyAdd"
    }

    fn matched_op(&self) -> OpType {
        OpType::Multiply
    }

    fn params(&self) -> &LayerParams {
        &self.params
    }

    fn params_mut(&mut self) -> &mut LayerParams {
        &mut self.params
    }

    fn transform(&self, _ctx: &mut TransformationContext<'_>, graph: &mut LptGraph, node: NodeId) -> Result<bool> {
        let Some((data_slot, scale)) = binary_constant(graph, node) else {
            return Ok(false);
        };
        let Some(subtract) = graph
            .input_node(node, data_slot)
            .filter(|&n| graph.is_op(n, OpType::Subtract))
        else {
            return Ok(false);
        };
        if graph.consumer_count(subtract) != 1 {
            return Ok(false);
        }
        let Some((0, zero_point)) = binary_constant(graph, subtract) else {
            return Ok(false);
        };
        let Some(data) = graph.input(subtract, 0) else {
            return Ok(false);
        };
        let (Some(zero_point), Some(scale_values), Some(precision)) = (
            graph.constant(zero_point),
            graph.constant(scale),
            graph.element_type(node),
        ) else {
            return Ok(false);
        };

        let negated = Tensor::new(zero_point.element_type(), zero_point.values().mapv(|v| -v));
        let bias = fold_multiply(&negated, scale_values)?;

        let name = graph.name(node).to_string();
        let multiply = graph
            .add_op(Op::Multiply)
            .name(format!("{}_Multiply", name))
            .input(data.0, data.1, 0)
            .input(scale, 0, 1)
            .precision(precision)
            .finish()?;
        let bias = graph.add_op(Op::Constant(bias)).finish()?;
        let add = graph
            .add_op(Op::Add)
            .name(name.clone())
            .inputs(&[multiply, bias])
            .precision(precision)
            .finish()?;
        graph.replace_node(node, add)?;

        debug!("Rewrote {} as Multiply-Add", name);
        Ok(true)
    }

    fn is_precision_preserved(&self, _graph: &LptGraph, _node: NodeId) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::low_precision::transformations::test_support::*;
    use crate::low_precision::TransformationRegistry;

    #[test]
    fn test_rewrites_zero_point_chain() {
        let mut graph = LptGraph::new();
        let shift = tensor(&mut graph, &[1, 2], vec![128.0, 0.0]);
        let scale = tensor(&mut graph, &[1, 2], vec![0.5, 0.25]);
        let (q, multiply) = dequantized(&mut graph, "q", vec![1, 2], Some(shift), scale);
        let result = graph.add_op(Op::Result).inputs(&[multiply]).finish().unwrap();
        let values = feed(&[1, 2], vec![0.0, 200.0]);
        let before = run(&graph, &[(q, values.clone())]);

        let registry = TransformationRegistry::new();
        let mut ctx = TransformationContext::new(&registry);
        let transformation = SubtractMultiplyToMultiplyAddTransformation::new(LayerParams::default());
        assert!(transformation.transform(&mut ctx, &mut graph, multiply).unwrap());

        let add = graph.input_node(result, 0).unwrap();
        assert!(graph.is_op(add, OpType::Add));
        assert_eq!(graph.name(add), "q_Multiply");
        let bias = graph.constant(graph.input_node(add, 1).unwrap()).unwrap();
        assert_eq!(bias.to_vec(), vec![-64.0, 0.0]);
        let new_multiply = graph.input_node(add, 0).unwrap();
        assert_eq!(graph.name(new_multiply), "q_Multiply_Multiply");
        assert!(graph.nodes_of_type(OpType::Subtract).is_empty());

        let after = run(&graph, &[(q, values)]);
        assert_close(&before, &after);

        // Nothing left to rewrite
        assert!(!transformation.transform(&mut ctx, &mut graph, new_multiply).unwrap());
    }
}
