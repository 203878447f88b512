// Convert fusion
//
// Multiply(Convert(x -> real), c) becomes a relaxed Multiply(x, c) that
// emits the Convert's destination type directly.

use crate::error::Result;
use crate::graph::{ElementType, LptGraph, NodeId, Op, OpType};
use crate::low_precision::layer_transformation::{LayerParams, LayerTransformation, TransformationContext};
use crate::low_precision::network_helper::binary_constant;
use tracing::debug;

pub struct FuseConvertTransformation {
    params: LayerParams,
}

impl FuseConvertTransformation {
    pub fn new(params: LayerParams) -> Self {
        Self { params }
    }
}

impl LayerTransformation for FuseConvertTransformation {
    fn name(&self) -> &str {
        "FuseConvert"
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
        let Some((data_slot, constant)) = binary_constant(graph, node) else {
            return Ok(false);
        };
        let Some(convert) = graph
            .input_node(node, data_slot)
            .filter(|&n| graph.is_op(n, OpType::Convert))
        else {
            return Ok(false);
        };
        if graph.consumer_count(convert) != 1 {
            return Ok(false);
        }
        let Some(destination) = graph.element_type(convert).filter(ElementType::is_real) else {
            return Ok(false);
        };
        let Some(data) = graph.input(convert, 0) else {
            return Ok(false);
        };

        let name = graph.name(node).to_string();
        let fused = graph
            .add_op(Op::Multiply)
            .name(name.clone())
            .input(data.0, data.1, 0)
            .input(constant, 0, 1)
            .precision(destination)
            .finish()?;
        graph.replace_node(node, fused)?;

        debug!("Fused Convert into {}", name);
        Ok(true)
    }

    fn is_precision_preserved(&self, _graph: &LptGraph, _node: NodeId) -> bool {
        false
    }

    fn is_quantized(&self, _graph: &LptGraph, _node: NodeId) -> bool {
        false
    }
}
