// FakeQuantize output fusion
//
// A constant Subtract or Multiply after a FakeQuantize (optionally through a
// Convert) is folded into the FakeQuantize output limits. Skipped when the
// result feeds a convolution, which needs its dequantization kept apart.

use crate::error::Result;
use crate::graph::fold::{broadcast_shape, fold_multiply, fold_subtract};
use crate::graph::{LptGraph, NodeId, Op, OpType, Tensor};
use crate::low_precision::layer_transformation::{LayerParams, LayerTransformation, TransformationContext};
use crate::low_precision::network_helper::binary_constant;
use tracing::debug;

/// Fold `node`'s constant into the output limits of the FakeQuantize before it
fn fuse_into_output_limits(
    graph: &mut LptGraph,
    node: NodeId,
    fold: impl Fn(&Tensor, &Tensor) -> Result<Tensor>,
) -> Result<bool> {
    let Some((data_slot, constant)) = binary_constant(graph, node) else {
        return Ok(false);
    };
    let Some(mut fq) = graph.input_node(node, data_slot) else {
        return Ok(false);
    };
    if graph.is_op(fq, OpType::Convert) && graph.consumer_count(fq) == 1 {
        match graph.input_node(fq, 0) {
            Some(parent) => fq = parent,
            None => return Ok(false),
        }
    }
    if !graph.is_op(fq, OpType::FakeQuantize) || graph.consumer_count(fq) != 1 {
        return Ok(false);
    }
    let feeds_convolution = graph
        .consumer_nodes(node)
        .into_iter()
        .any(|consumer| graph.is_op(consumer, OpType::Convolution) || graph.is_op(consumer, OpType::GroupConvolution));
    if feeds_convolution {
        return Ok(false);
    }

    let inputs = graph.inputs(fq);
    let Some((levels, name)) = graph.node(fq).and_then(|n| match n.op {
        Op::FakeQuantize { levels } => Some((levels, n.name.clone())),
        _ => None,
    }) else {
        return Ok(false);
    };
    if inputs.len() != 5 {
        return Ok(false);
    }
    let (Some(output_low), Some(output_high), Some(value)) = (
        graph.constant(inputs[3].0),
        graph.constant(inputs[4].0),
        graph.constant(constant),
    ) else {
        return Ok(false);
    };

    let new_low = fold(output_low, value)?;
    let new_high = fold(output_high, value)?;
    let data_shape = graph.shape(fq).map(<[usize]>::to_vec).unwrap_or_default();
    let fits = |limit: &Tensor| broadcast_shape(limit.shape(), &data_shape).as_deref() == Some(&data_shape[..]);
    if !fits(&new_low) || !fits(&new_high) {
        return Ok(false);
    }
    let Some(precision) = graph.element_type(node) else {
        return Ok(false);
    };

    let new_low = graph.add_op(Op::Constant(new_low)).finish()?;
    let new_high = graph.add_op(Op::Constant(new_high)).finish()?;
    let fused = graph
        .add_op(Op::FakeQuantize { levels })
        .name(name.clone())
        .input(inputs[0].0, inputs[0].1, 0)
        .input(inputs[1].0, inputs[1].1, 1)
        .input(inputs[2].0, inputs[2].1, 2)
        .input(new_low, 0, 3)
        .input(new_high, 0, 4)
        .precision(precision)
        .finish()?;
    let fused_name = graph.name(node).to_string();
    graph.replace_node(node, fused)?;

    debug!("Fused {} into the output limits of {}", fused_name, name);
    Ok(true)
}

pub struct FuseSubtractToFakeQuantizeTransformation {
    params: LayerParams,
}

impl FuseSubtractToFakeQuantizeTransformation {
    pub fn new(params: LayerParams) -> Self {
        Self { params }
    }
}

impl LayerTransformation for FuseSubtractToFakeQuantizeTransformation {
    fn name(&self) -> &str {
        "FuseSubtractToFakeQuantize"
    }

    fn matched_op(&self) -> OpType {
        OpType::Subtract
    }

    fn params(&self) -> &LayerParams {
        &self.params
    }

    fn params_mut(&mut self) -> &mut LayerParams {
        &mut self.params
    }

    fn transform(&self, _ctx: &mut TransformationContext<'_>, graph: &mut LptGraph, node: NodeId) -> Result<bool> {
        // x - c only; c - x flips the interval
        if !matches!(binary_constant(graph, node), Some((0, _))) {
            return Ok(false);
        }
        fuse_into_output_limits(graph, node, |limit, value| Ok(fold_subtract(limit, value)?))
    }

    fn is_precision_preserved(&self, _graph: &LptGraph, _node: NodeId) -> bool {
        false
    }
}

pub struct FuseMultiplyToFakeQuantizeTransformation {
    params: LayerParams,
}

impl FuseMultiplyToFakeQuantizeTransformation {
    pub fn new(params: LayerParams) -> Self {
        Self { params }
    }
}

impl LayerTransformation for FuseMultiplyToFakeQuantizeTransformation {
    fn name(&self) -> &str {
        "FuseMultiplyToFakeQuantize"
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
        fuse_into_output_limits(graph, node, |limit, value| Ok(fold_multiply(limit, value)?))
    }

    fn is_precision_preserved(&self, _graph: &LptGraph, _node: NodeId) -> bool {
        false
    }
}
