// MatMul
//
// (x * s) @ w == (x @ w) * s when s is a single value, on either operand.

use crate::error::Result;
use crate::graph::{LptGraph, NodeId, OpType};
use crate::low_precision::layer_transformation::{LayerParams, LayerTransformation, TransformationContext};
use crate::low_precision::network_helper::{get_dequantization, move_dequantization_after};
use tracing::debug;

pub struct MatMulTransformation {
    params: LayerParams,
}

impl MatMulTransformation {
    pub fn new(params: LayerParams) -> Self {
        Self { params }
    }
}

impl LayerTransformation for MatMulTransformation {
    fn name(&self) -> &str {
        "MatMul"
    }

    fn matched_op(&self) -> OpType {
        OpType::MatMul
    }

    fn params(&self) -> &LayerParams {
        &self.params
    }

    fn params_mut(&mut self) -> &mut LayerParams {
        &mut self.params
    }

    fn transform(&self, _ctx: &mut TransformationContext<'_>, graph: &mut LptGraph, node: NodeId) -> Result<bool> {
        for input in 0..2 {
            let dequantization = get_dequantization(graph, node, input);
            if dequantization.subtract.is_some() {
                continue;
            }
            let movable = dequantization.scale(graph).map(|s| s.is_scalar_like()).unwrap_or(false);
            if !movable {
                continue;
            }

            debug!("Moving dequantization of input {} after {}", input, graph.name(node));
            move_dequantization_after(graph, node, &dequantization, false, false)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn is_precision_preserved(&self, _graph: &LptGraph, _node: NodeId) -> bool {
        false
    }
}
