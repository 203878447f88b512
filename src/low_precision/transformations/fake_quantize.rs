// FakeQuantize decomposition
//
// Splits every supported FakeQuantize into a quantize that emits the
// low-precision range and the dequantization chain restoring the real range.

use crate::error::Result;
use crate::graph::{LptGraph, NodeId, OpType};
use crate::low_precision::layer_transformation::{
    DataPrecision, LayerParams, LayerTransformation, QuantizationDetails, TransformationContext,
};
use crate::low_precision::network_helper::decompose_fake_quantize;
use tracing::debug;

pub struct FakeQuantizeTransformation {
    params: LayerParams,
}

impl FakeQuantizeTransformation {
    pub fn new(params: LayerParams) -> Self {
        Self { params }
    }

    /// Allowed precisions narrowed by what the consumers accept
    fn allowed_params(&self, ctx: &TransformationContext<'_>, graph: &LptGraph, node: NodeId) -> LayerParams {
        let mut params = self.params.clone();
        for consumer in graph.consumer_nodes(node) {
            let accepted = ctx.precisions_on_activations(graph, consumer);
            if !accepted.is_empty() {
                params.precisions_on_activations.retain(|p| accepted.contains(p));
            }
        }
        params
    }
}

impl LayerTransformation for FakeQuantizeTransformation {
    fn name(&self) -> &str {
        "FakeQuantize"
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

    fn transform(&self, ctx: &mut TransformationContext<'_>, graph: &mut LptGraph, node: NodeId) -> Result<bool> {
        if ctx.is_handled(graph, node) {
            return Ok(false);
        }
        let Some(details) = QuantizationDetails::from_fake_quantize(graph, node) else {
            debug!("Skipping {}: limits are not constant", graph.name(node));
            return Ok(false);
        };
        if !QuantizationDetails::is_supported_levels(details.levels) {
            debug!("Skipping {}: {} levels", graph.name(node), details.levels);
            return Ok(false);
        }

        let params = self.allowed_params(ctx, graph, node);
        let Some(data_precision) = DataPrecision::resolve(&details, &params) else {
            debug!("Skipping {}: no precision fits", graph.name(node));
            return Ok(false);
        };

        let (quantize, _) = decompose_fake_quantize(
            graph,
            node,
            data_precision.precision,
            data_precision.min,
            data_precision.max,
            data_precision.has_zero_point,
            params.update_precisions,
        )?;
        ctx.mark_handled(graph, quantize);
        Ok(true)
    }

    fn is_precision_preserved(&self, _graph: &LptGraph, _node: NodeId) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ElementType, Op};
    use crate::low_precision::transformations::test_support::*;
    use crate::low_precision::TransformationRegistry;

    fn fake_quantize(graph: &mut LptGraph, levels: usize, low: f32, high: f32) -> (NodeId, NodeId, NodeId) {
        let input = parameter(graph, "input", ElementType::F32, vec![1, 4]);
        let low = scalar(graph, low);
        let high = scalar(graph, high);
        let fq = graph
            .add_op(Op::FakeQuantize { levels })
            .name("fq")
            .inputs(&[input, low, high, low, high])
            .relaxed()
            .finish()
            .unwrap();
        let result = graph.add_op(Op::Result).inputs(&[fq]).finish().unwrap();
        (input, fq, result)
    }

    #[test]
    fn test_decomposes_unsigned() {
        let mut graph = LptGraph::new();
        let (input, fq, result) = fake_quantize(&mut graph, 256, 0.0, 2.55);
        let values = feed(&[1, 4], vec![-1.0, 0.3, 1.0, 3.0]);
        let before = run(&graph, &[(input, values.clone())]);

        let registry = TransformationRegistry::all(LayerParams::default());
        let mut ctx = TransformationContext::new(&registry);
        let transformation = FakeQuantizeTransformation::new(LayerParams::default());
        assert!(transformation.transform(&mut ctx, &mut graph, fq).unwrap());

        let tail = graph.input_node(result, 0).unwrap();
        assert_eq!(graph.name(tail), "fq_original_Multiply");
        let quantize = graph.find_by_name("fq_original").unwrap();
        assert_eq!(graph.element_type(quantize), Some(ElementType::U8));
        assert!(ctx.is_handled(&graph, quantize));
        // No zero point for a range starting at 0
        assert!(graph.nodes_of_type(OpType::Subtract).is_empty());

        // The narrowed quantize is never decomposed twice
        assert!(!transformation.transform(&mut ctx, &mut graph, quantize).unwrap());

        let after = run(&graph, &[(input, values)]);
        assert_close(&before, &after);
    }

    #[test]
    fn test_skips_unsupported_levels() {
        let mut graph = LptGraph::new();
        let (_, fq, _) = fake_quantize(&mut graph, 16, 0.0, 1.0);

        let registry = TransformationRegistry::new();
        let mut ctx = TransformationContext::new(&registry);
        let transformation = FakeQuantizeTransformation::new(LayerParams::default());
        assert!(!transformation.transform(&mut ctx, &mut graph, fq).unwrap());
        assert!(graph.contains(fq));
    }

    #[test]
    fn test_skips_when_zero_point_is_unsupported() {
        let mut graph = LptGraph::new();
        let (_, fq, _) = fake_quantize(&mut graph, 256, 0.5, 2.0);

        let registry = TransformationRegistry::new();
        let mut ctx = TransformationContext::new(&registry);
        let params = LayerParams::default().with_support_asymmetric_quantization(false);
        let transformation = FakeQuantizeTransformation::new(params);
        assert!(!transformation.transform(&mut ctx, &mut graph, fq).unwrap());
    }
}
