//! Concat with independent per-channel dequantization
//!
//! Each FakeQuantize producer keeps its own scale and shift; the Concat
//! receives one dequantization whose constants are concatenated along the
//! Concat axis. Falls back to the single-scale rule when a Convolution sits
//! downstream, since a convolution needs one scale across input channels.

use super::concat::{
    add_dequantization_layers, collect_subgraph, common_levels, finish_subgraph, producer_details,
    transform_single_scale, DequantizationCache,
};
use super::layer_transformation::{DataPrecision, LayerParams, LayerTransformation, TransformationContext};
use super::network_helper::{create_dequantization_from_fake_quantize, get_children_recursively_except_types, update_fake_quantize};
use super::subgraph::Subgraph;
use crate::error::Result;
use crate::graph::{ElementType, LptGraph, NodeId, OpType};
use tracing::debug;

/// Consumers looked through when searching for a downstream Convolution
const TRANSPARENT_TYPES: [OpType; 3] = [OpType::AvgPool, OpType::Interpolate, OpType::MaxPool];

/// Branch-specific Concat transformation
pub struct ConcatMultiChannelsTransformation {
    params: LayerParams,
}

impl ConcatMultiChannelsTransformation {
    pub fn new(params: LayerParams) -> Self {
        Self { params }
    }
}

/// No Concat of the subgraph reaches a Convolution through pooling or resampling only
pub fn is_multi_channel(graph: &LptGraph, concats: &[NodeId]) -> bool {
    concats.iter().all(|&concat| {
        get_children_recursively_except_types(graph, concat, &TRANSPARENT_TYPES)
            .into_iter()
            .all(|child| !graph.is_op(child, OpType::Convolution))
    })
}

impl LayerTransformation for ConcatMultiChannelsTransformation {
    fn name(&self) -> &str {
        "ConcatMultiChannels"
    }

    fn matched_op(&self) -> OpType {
        OpType::Concat
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
        let Some(mut subgraph) = collect_subgraph(ctx, graph, node)? else {
            return Ok(false);
        };

        if !is_multi_channel(graph, &subgraph.concat_layers) {
            debug!("{} feeds a Convolution, using one scale", graph.name(node));
            return transform_single_scale(ctx, graph, &mut subgraph, &self.params);
        }

        self.transform_multi_channel(ctx, graph, &mut subgraph)
    }

    fn is_precision_preserved(&self, _graph: &LptGraph, _node: NodeId) -> bool {
        true
    }
}

impl ConcatMultiChannelsTransformation {
    fn transform_multi_channel(
        &self,
        ctx: &mut TransformationContext<'_>,
        graph: &mut LptGraph,
        subgraph: &mut Subgraph,
    ) -> Result<bool> {
        let Some(&concat) = subgraph.concat_layers.first() else {
            return Ok(false);
        };
        let Some(details) = producer_details(graph, subgraph) else {
            return Ok(false);
        };
        let levels = common_levels(graph, &details, concat)?;

        let resolved: Option<Vec<DataPrecision>> = details
            .iter()
            .map(|detail| DataPrecision::resolve(detail, &self.params))
            .collect();
        let Some(resolved) = resolved else {
            return Ok(false);
        };
        let Some(targets) = self.common_target(&resolved, levels) else {
            debug!("Skipping {}: producers need a zero point", graph.name(concat));
            return Ok(false);
        };

        let mut cache = DequantizationCache::default();
        for (fq, target) in subgraph.quantization_layers.clone().into_iter().zip(targets) {
            let values = create_dequantization_from_fake_quantize(
                graph,
                fq,
                target.precision,
                target.min,
                target.max,
                target.has_zero_point,
            )?;
            let precision = if self.params.update_precisions {
                target.precision
            } else {
                values.original_type
            };

            cache.insert(fq, values);
            let new_fq = update_fake_quantize(graph, fq, precision, target.min.round(), target.max.round())?;
            cache.rekey(fq, new_fq);
            subgraph.replace(fq, new_fq);
            ctx.mark_handled(graph, new_fq);
        }

        let precision = resolved.first().map(|dp| dp.precision).unwrap_or(ElementType::U8);
        let precision = if resolved.iter().all(|dp| dp.precision == precision) {
            precision
        } else {
            self.fallback_precision()
        };

        add_dequantization_layers(graph, subgraph, &cache, self.params.update_precisions)?;
        finish_subgraph(ctx, graph, subgraph, precision, self.params.update_precisions)?;

        debug!(
            "Quantized concat subgraph of {} per channel ({}, {} producers)",
            graph.name(concat),
            precision,
            subgraph.quantization_layers.len()
        );
        Ok(true)
    }

    /// One target per producer sharing a single precision and range
    ///
    /// When producers resolve to different precisions, all of them move to
    /// the first allowed precision with a zero point.
    fn common_target(&self, resolved: &[DataPrecision], levels: usize) -> Option<Vec<DataPrecision>> {
        let first = resolved.first()?;
        if resolved.iter().all(|dp| dp.precision == first.precision) {
            return Some(resolved.to_vec());
        }
        if !self.params.support_asymmetric_quantization {
            return None;
        }

        let precision = self.fallback_precision();
        let (min, max) = DataPrecision::range(precision, levels)?;
        let target = DataPrecision {
            precision,
            min,
            max,
            has_zero_point: true,
        };
        Some(vec![target; resolved.len()])
    }

    fn fallback_precision(&self) -> ElementType {
        self.params
            .precisions_on_activations
            .first()
            .copied()
            .unwrap_or(ElementType::U8)
    }
}
