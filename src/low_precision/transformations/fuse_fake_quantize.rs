// FakeQuantize input fusion
//
// Folds a constant elementwise op feeding a FakeQuantize into its input
// limits:
// - FQ(x * a, il, ih) == FQ(x, il / a, ih / a) for a single a > 0
// - FQ(x - s, il, ih) == FQ(x, il + s, ih + s)
// - FQ(x + s, il, ih) == FQ(x, il - s, ih - s)

use crate::error::Result;
use crate::graph::fold::{broadcast_shape, fold_add, fold_divide, fold_subtract};
use crate::graph::{LptGraph, NodeId, Op, OpType, Tensor};
use crate::low_precision::layer_transformation::{LayerParams, LayerTransformation, TransformationContext};
use crate::low_precision::network_helper::binary_constant;
use tracing::debug;

pub struct FuseFakeQuantizeTransformation {
    params: LayerParams,
}

impl FuseFakeQuantizeTransformation {
    pub fn new(params: LayerParams) -> Self {
        Self { params }
    }
}

/// New input limits with `parent` folded in, plus the data feeding `parent`
fn fold_parent(graph: &LptGraph, parent: NodeId, low: &Tensor, high: &Tensor) -> Result<Option<(Tensor, Tensor)>> {
    let Some((data_slot, constant)) = binary_constant(graph, parent) else {
        return Ok(None);
    };
    let Some(value) = graph.constant(constant) else {
        return Ok(None);
    };

    let limits = match graph.op_type(parent) {
        Some(OpType::Multiply) => {
            if !value.is_scalar_like() || value.first().map(|v| v <= 0.0).unwrap_or(true) {
                return Ok(None);
            }
            (fold_divide(low, value)?, fold_divide(high, value)?)
        }
        Some(OpType::Subtract) if data_slot == 0 => (fold_add(low, value)?, fold_add(high, value)?),
        Some(OpType::Add) => (fold_subtract(low, value)?, fold_subtract(high, value)?),
        _ => return Ok(None),
    };
    Ok(Some(limits))
}

impl LayerTransformation for FuseFakeQuantizeTransformation {
    fn name(&self) -> &str {
        "FuseFakeQuantize"
    }

    fn matched_op(&self) -> OpType {
        OpType::FakeQuantize
    }

    fn params(&self) -> &LayerParams {
        &self.params
    }

    fn params_mut(&mut self) -> &mut LayerParams {
        &mut self.params
    }

    fn transform(&self, _ctx: &mut TransformationContext<'_>, graph: &mut LptGraph, node: NodeId) -> Result<bool> {
        let Some(fq) = graph.node(node).cloned() else {
            return Ok(false);
        };
        let Op::FakeQuantize { levels } = fq.op else {
            return Ok(false);
        };
        let inputs = graph.inputs(node);
        if inputs.len() != 5 {
            return Ok(false);
        }
        let parent = inputs[0].0;
        if graph.consumer_count(parent) != 1 {
            return Ok(false);
        }
        let (Some(low), Some(high)) = (graph.constant(inputs[1].0), graph.constant(inputs[2].0)) else {
            return Ok(false);
        };
        let Some((new_low, new_high)) = fold_parent(graph, parent, low, high)? else {
            return Ok(false);
        };
        let Some((data_slot, _)) = binary_constant(graph, parent) else {
            return Ok(false);
        };
        let Some(data) = graph.input(parent, data_slot) else {
            return Ok(false);
        };

        // Limits may broadcast against the data, never widen it
        let data_shape = graph.shape(data.0).map(<[usize]>::to_vec).unwrap_or_default();
        let fits = |limit: &Tensor| broadcast_shape(limit.shape(), &data_shape).as_deref() == Some(&data_shape[..]);
        if !fits(&new_low) || !fits(&new_high) {
            return Ok(false);
        }

        let new_low = graph.add_op(Op::Constant(new_low)).finish()?;
        let new_high = graph.add_op(Op::Constant(new_high)).finish()?;
        let mut builder = graph
            .add_op(Op::FakeQuantize { levels })
            .name(fq.name.clone())
            .input(data.0, data.1, 0)
            .input(new_low, 0, 1)
            .input(new_high, 0, 2)
            .input(inputs[3].0, inputs[3].1, 3)
            .input(inputs[4].0, inputs[4].1, 4);
        if fq.type_relaxed {
            builder = builder.relaxed();
        }
        if let Some(precision) = fq.precision_override {
            builder = builder.precision(precision);
        }
        let fused = builder.finish()?;
        graph.replace_node(node, fused)?;

        debug!("Fused {} into the limits of {}", graph.name(parent), fq.name);
        Ok(true)
    }

    fn is_precision_preserved(&self, _graph: &LptGraph, _node: NodeId) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ElementType;
    use crate::low_precision::transformations::test_support::*;
    use crate::low_precision::TransformationRegistry;

    fn fake_quantize_after(graph: &mut LptGraph, op: Op, constant: f32) -> (NodeId, NodeId, NodeId) {
        let input = parameter(graph, "x", ElementType::F32, vec![1, 4]);
        let constant = scalar(graph, constant);
        let parent = graph.add_op(op).inputs(&[input, constant]).finish().unwrap();
        let (low, high) = (scalar(graph, 0.0), scalar(graph, 2.55));
        let fq = graph
            .add_op(Op::FakeQuantize { levels: 256 })
            .name("fq")
            .inputs(&[parent, low, high, low, high])
            .finish()
            .unwrap();
        let result = graph.add_op(Op::Result).inputs(&[fq]).finish().unwrap();
        (input, fq, result)
    }

    fn check(op: Op, constant: f32, expected_low: f32, expected_high: f32) {
        let mut graph = LptGraph::new();
        let (input, fq, result) = fake_quantize_after(&mut graph, op, constant);
        let values = feed(&[1, 4], vec![-1.0, 0.2, 0.9, 4.0]);
        let before = run(&graph, &[(input, values.clone())]);

        let registry = TransformationRegistry::new();
        let mut ctx = TransformationContext::new(&registry);
        assert!(FuseFakeQuantizeTransformation::new(LayerParams::default())
            .transform(&mut ctx, &mut graph, fq)
            .unwrap());

        let fused = graph.input_node(result, 0).unwrap();
        assert_eq!(graph.name(fused), "fq");
        assert_eq!(graph.input_node(fused, 0), Some(input));
        let low = graph.constant(graph.input_node(fused, 1).unwrap()).unwrap();
        let high = graph.constant(graph.input_node(fused, 2).unwrap()).unwrap();
        approx::assert_relative_eq!(low.first().unwrap(), expected_low, epsilon = 1e-6);
        approx::assert_relative_eq!(high.first().unwrap(), expected_high, epsilon = 1e-6);

        let after = run(&graph, &[(input, values)]);
        assert_close(&before, &after);
    }

    #[test]
    fn test_fuses_multiply() {
        check(Op::Multiply, 2.0, 0.0, 1.275);
    }

    #[test]
    fn test_fuses_subtract() {
        check(Op::Subtract, 0.5, 0.5, 3.05);
    }

    #[test]
    fn test_fuses_add() {
        check(Op::Add, 0.5, -0.5, 2.05);
    }

    #[test]
    fn test_declines_negative_multiplier() {
        let mut graph = LptGraph::new();
        let (_, fq, _) = fake_quantize_after(&mut graph, Op::Multiply, -2.0);

        let registry = TransformationRegistry::new();
        let mut ctx = TransformationContext::new(&registry);
        assert!(!FuseFakeQuantizeTransformation::new(LayerParams::default())
            .transform(&mut ctx, &mut graph, fq)
            .unwrap());
    }
}
