// Multiply
//
// A dequantized input multiplied by a constant: the dequantization scale and
// the constant fold into one Multiply.

use crate::error::Result;
use crate::graph::{LptGraph, NodeId, OpType};
use crate::low_precision::layer_transformation::{LayerParams, LayerTransformation, TransformationContext};
use crate::low_precision::network_helper::{binary_constant, get_dequantization, optimize_multiplies_after};

pub struct MultiplyTransformation {
    params: LayerParams,
}

impl MultiplyTransformation {
    pub fn new(params: LayerParams) -> Self {
        Self { params }
    }
}

impl LayerTransformation for MultiplyTransformation {
    fn name(&self) -> &str {
        "Multiply"
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
        let Some((data_slot, _)) = binary_constant(graph, node) else {
            return Ok(false);
        };
        let Some(multiply) = get_dequantization(graph, node, data_slot).multiply else {
            return Ok(false);
        };

        Ok(optimize_multiplies_after(graph, multiply)?.is_some())
    }

    fn is_precision_preserved(&self, _graph: &LptGraph, _node: NodeId) -> bool {
        false
    }
}
