// Layout operations: Reshape, Squeeze, Transpose, Unsqueeze
//
// A layout op moves elements around, so only a dequantization with the same
// value everywhere commutes with it. Its constants are reduced to rank 0
// before the move so they broadcast against any output shape.

use crate::error::Result;
use crate::graph::{LptGraph, NodeId, Op, OpType};
use crate::low_precision::dequantization::FakeQuantizeDequantization;
use crate::low_precision::layer_transformation::{LayerParams, LayerTransformation, TransformationContext};
use crate::low_precision::network_helper::{get_dequantization, move_dequantization_after};

pub struct LayoutTransformation {
    op_type: OpType,
    params: LayerParams,
}

impl LayoutTransformation {
    pub fn new(op_type: OpType, params: LayerParams) -> Self {
        Self { op_type, params }
    }
}

impl LayerTransformation for LayoutTransformation {
    fn name(&self) -> &str {
        self.op_type.name()
    }

    fn matched_op(&self) -> OpType {
        self.op_type
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
        if !scale.is_scalar_like() {
            return Ok(false);
        }
        if let Some(shift) = dequantization.shift(graph) {
            if !shift.is_scalar_like() {
                return Ok(false);
            }
        }

        scalarize_constants(graph, &dequantization)?;
        move_dequantization_after(graph, node, &dequantization, false, true)?;
        Ok(true)
    }

    fn is_precision_preserved(&self, _graph: &LptGraph, _node: NodeId) -> bool {
        true
    }
}

/// Swap the chain constants for rank-0 copies
fn scalarize_constants(graph: &mut LptGraph, dequantization: &FakeQuantizeDequantization) -> Result<()> {
    let stages = [dequantization.subtract, dequantization.multiply];
    for stage in stages.into_iter().flatten() {
        let constant_slot = graph
            .inputs(stage)
            .into_iter()
            .enumerate()
            .find(|(_, (source, _))| graph.is_constant(*source));
        let Some((slot, (constant, _))) = constant_slot else {
            continue;
        };
        let Some(scalar) = graph.constant(constant).and_then(|t| t.to_scalar()) else {
            continue;
        };
        if graph.shape(constant).map(<[usize]>::is_empty).unwrap_or(false) {
            continue;
        }

        let scalar = graph.add_op(Op::Constant(scalar)).finish()?;
        graph.set_input(stage, slot as u8, (scalar, 0))?;
        graph.prune(constant);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ElementType;
    use crate::low_precision::transformations::test_support::*;
    use crate::low_precision::TransformationRegistry;

    fn layout_after(graph: &mut LptGraph, op: Op, scale: NodeId, shift: Option<NodeId>) -> (NodeId, NodeId, NodeId) {
        let (q, deq) = dequantized(graph, "q", vec![1, 2, 3], shift, scale);
        let layout = graph.add_op(op).name("layout").inputs(&[deq]).finish().unwrap();
        let result = graph.add_op(Op::Result).inputs(&[layout]).finish().unwrap();
        (q, layout, result)
    }

    #[test]
    fn test_transpose_with_scalar_like_constants() {
        let mut graph = LptGraph::new();
        let scale = tensor(&mut graph, &[1, 2, 1], vec![0.5, 0.5]);
        let shift = tensor(&mut graph, &[1, 1, 1], vec![3.0]);
        let (q, layout, result) = layout_after(
            &mut graph,
            Op::Transpose {
                order: vec![0, 2, 1],
            },
            scale,
            Some(shift),
        );
        let values = feed(&[1, 2, 3], vec![0.0, 1.0, 2.0, 3.0, 4.0, 250.0]);
        let before = run(&graph, &[(q, values.clone())]);

        let registry = TransformationRegistry::new();
        let mut ctx = TransformationContext::new(&registry);
        let transformation = LayoutTransformation::new(OpType::Transpose, LayerParams::default());
        assert_eq!(transformation.name(), "Transpose");
        assert!(transformation.transform(&mut ctx, &mut graph, layout).unwrap());

        let multiply = graph.input_node(result, 0).unwrap();
        assert_eq!(graph.name(multiply), "layout_Multiply");
        let scale = graph.constant(graph.input_node(multiply, 1).unwrap()).unwrap();
        assert!(scale.shape().is_empty());
        let subtract = graph.input_node(multiply, 0).unwrap();
        let shift = graph.constant(graph.input_node(subtract, 1).unwrap()).unwrap();
        assert!(shift.shape().is_empty());

        let after = run(&graph, &[(q, values)]);
        assert_close(&before, &after);
    }

    #[test]
    fn test_reshape_declines_per_channel_scale() {
        let mut graph = LptGraph::new();
        let scale = tensor(&mut graph, &[1, 2, 1], vec![0.5, 0.25]);
        let (_, layout, _) = layout_after(&mut graph, Op::Reshape { shape: vec![6] }, scale, None);

        let registry = TransformationRegistry::new();
        let mut ctx = TransformationContext::new(&registry);
        let transformation = LayoutTransformation::new(OpType::Reshape, LayerParams::default());
        assert!(!transformation.transform(&mut ctx, &mut graph, layout).unwrap());
    }

    #[test]
    fn test_unsqueeze_keeps_low_precision_data() {
        let mut graph = LptGraph::new();
        let scale = tensor(&mut graph, &[1], vec![0.1]);
        let (q, layout, _) = layout_after(&mut graph, Op::Unsqueeze { axes: vec![0] }, scale, None);

        let registry = TransformationRegistry::new();
        let mut ctx = TransformationContext::new(&registry);
        let transformation = LayoutTransformation::new(OpType::Unsqueeze, LayerParams::default());
        assert!(transformation.transform(&mut ctx, &mut graph, layout).unwrap());

        let new_layout = graph.find_by_name("layout").unwrap();
        assert_eq!(graph.input_node(new_layout, 0), Some(q));
        assert_eq!(graph.element_type(new_layout), Some(ElementType::U8));
        assert_eq!(graph.shape(new_layout), Some(&[1, 1, 2, 3][..]));
    }
}
