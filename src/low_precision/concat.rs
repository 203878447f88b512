//! Concat with one shared scale
//!
//! Maps the union of every producer interval onto a single low-precision
//! range, narrows each producer to its share of that range and inserts one
//! dequantization after the subgraph. Also hosts the assembly shared with the
//! multi-channel rule.

use super::dequantization::DequantizationValues;
use super::layer_transformation::{
    DataPrecision, LayerParams, LayerTransformation, QuantizationDetails, TransformationContext,
};
use super::network_helper::{is_zero_tensor, to_scalar_if_possible, update_fake_quantize};
use super::subgraph::Subgraph;
use crate::error::{LptError, Result};
use crate::graph::{ElementType, LptGraph, NodeId, Op, OpType, Tensor};
use ndarray::IxDyn;
use rustc_hash::FxHashMap;
use tracing::debug;

/// Dequantization values per FakeQuantize of a subgraph
///
/// Keys follow node identity; rewrites that replace a producer must move
/// its entry with [`DequantizationCache::rekey`].
#[derive(Debug, Default)]
pub struct DequantizationCache {
    entries: FxHashMap<NodeId, DequantizationValues>,
}

impl DequantizationCache {
    pub fn insert(&mut self, node: NodeId, values: DequantizationValues) {
        self.entries.insert(node, values);
    }

    pub fn get(&self, node: NodeId) -> Option<&DequantizationValues> {
        self.entries.get(&node)
    }

    /// Move the entry of `old` to `new`
    pub fn rekey(&mut self, old: NodeId, new: NodeId) {
        if old == new {
            return;
        }
        if let Some(values) = self.entries.remove(&old) {
            self.entries.insert(new, values);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Generic Concat transformation with one scale for every input
pub struct ConcatTransformation {
    params: LayerParams,
}

impl ConcatTransformation {
    pub fn new(params: LayerParams) -> Self {
        Self { params }
    }
}

impl LayerTransformation for ConcatTransformation {
    fn name(&self) -> &str {
        "Concat"
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
        match collect_subgraph(ctx, graph, node)? {
            Some(mut subgraph) => transform_single_scale(ctx, graph, &mut subgraph, &self.params),
            None => Ok(false),
        }
    }

    fn is_precision_preserved(&self, _graph: &LptGraph, _node: NodeId) -> bool {
        true
    }
}

/// Discover the subgraph around `concat`
///
/// Returns `None` when discovery fails structurally, no FakeQuantize feeds
/// it, or part of it was already rewritten in this run.
pub fn collect_subgraph(ctx: &TransformationContext<'_>, graph: &LptGraph, concat: NodeId) -> Result<Option<Subgraph>> {
    let mut subgraph = Subgraph::new();
    match subgraph.fill_subgraph_for_concat(ctx, graph, concat) {
        Ok(()) => {}
        Err(err) if err.is_recoverable() => {
            debug!("Skipping {}: {}", graph.name(concat), err);
            return Ok(None);
        }
        Err(err) => return Err(err),
    }

    if subgraph.quantization_layers.is_empty() || subgraph.layers.iter().any(|&layer| ctx.is_handled(graph, layer)) {
        return Ok(None);
    }
    Ok(Some(subgraph))
}

/// Constant limits of every producer, or `None` if any is not constant
pub(crate) fn producer_details(graph: &LptGraph, subgraph: &Subgraph) -> Option<Vec<QuantizationDetails>> {
    subgraph
        .quantization_layers
        .iter()
        .map(|&fq| QuantizationDetails::from_fake_quantize(graph, fq))
        .collect()
}

/// Common level count of all producers
pub(crate) fn common_levels(graph: &LptGraph, details: &[QuantizationDetails], concat: NodeId) -> Result<usize> {
    let levels = details.first().map(|d| d.levels).unwrap_or(0);
    if details.iter().any(|d| d.levels != levels) {
        return Err(LptError::UnsupportedConfiguration(format!(
            "FakeQuantize producers of {} use different quantization levels",
            graph.name(concat)
        )));
    }
    Ok(levels)
}

/// Rewrite a subgraph with a single scale and shift
pub fn transform_single_scale(
    ctx: &mut TransformationContext<'_>,
    graph: &mut LptGraph,
    subgraph: &mut Subgraph,
    params: &LayerParams,
) -> Result<bool> {
    let Some(&concat) = subgraph.concat_layers.first() else {
        return Ok(false);
    };
    let Some(details) = producer_details(graph, subgraph) else {
        return Ok(false);
    };
    if !details.iter().all(QuantizationDetails::is_per_tensor) {
        debug!("Skipping {}: per-channel producers need the multi-channel rule", graph.name(concat));
        return Ok(false);
    }
    let levels = common_levels(graph, &details, concat)?;

    let low = details.iter().map(QuantizationDetails::output_low_min).fold(f32::INFINITY, f32::min);
    let high = details.iter().map(QuantizationDetails::output_high_max).fold(f32::NEG_INFINITY, f32::max);
    let common = QuantizationDetails {
        levels,
        input_low: vec![low],
        input_high: vec![high],
        output_low: vec![low],
        output_high: vec![high],
    };
    let Some(data_precision) = DataPrecision::resolve(&common, params) else {
        return Ok(false);
    };

    let scale = (high - low) / (data_precision.max - data_precision.min);
    if !scale.is_finite() || scale == 0.0 {
        return Ok(false);
    }
    let shift = if data_precision.has_zero_point {
        (data_precision.min * high - data_precision.max * low) / (high - low)
    } else {
        0.0
    };

    let original_type = subgraph
        .quantization_layers
        .first()
        .and_then(|&fq| graph.element_type(fq))
        .unwrap_or(ElementType::F32);
    let shift_tensor = Tensor::scalar(original_type, shift);
    let values = DequantizationValues {
        original_type,
        precision: data_precision.precision,
        shift: (!is_zero_tensor(&shift_tensor)).then_some(shift_tensor),
        scale: Tensor::scalar(original_type, scale),
    };

    let mut cache = DequantizationCache::default();
    for (fq, detail) in subgraph.quantization_layers.clone().into_iter().zip(&details) {
        let min = (detail.output_low[0] / scale + shift).round();
        let max = (detail.output_high[0] / scale + shift).round();
        let precision = if params.update_precisions {
            data_precision.precision
        } else {
            graph.element_type(fq).unwrap_or(original_type)
        };

        cache.insert(fq, values.clone());
        let new_fq = update_fake_quantize(graph, fq, precision, min, max)?;
        cache.rekey(fq, new_fq);
        subgraph.replace(fq, new_fq);
        ctx.mark_handled(graph, new_fq);
    }

    add_dequantization_layers(graph, subgraph, &cache, params.update_precisions)?;
    finish_subgraph(ctx, graph, subgraph, data_precision.precision, params.update_precisions)?;

    debug!(
        "Quantized concat subgraph of {} with one scale ({})",
        graph.name(concat),
        data_precision.precision
    );
    Ok(true)
}

/// Insert a dequantization chain after every subgraph layer with consumers
/// outside the subgraph
pub fn add_dequantization_layers(
    graph: &mut LptGraph,
    subgraph: &Subgraph,
    cache: &DequantizationCache,
    with_convert: bool,
) -> Result<()> {
    for &layer in &subgraph.layers {
        let outside: Vec<(NodeId, u8)> = graph
            .consumers(layer)
            .into_iter()
            .filter(|&(consumer, _)| !subgraph.contains(consumer))
            .collect();
        if outside.is_empty() {
            continue;
        }

        let values = fill_dequantization(graph, layer, cache)?;
        let name = graph.name(layer).to_string();
        let chain = values.materialize(graph, (layer, 0), &name, with_convert)?;
        let tail = chain.tail();
        for (consumer, slot) in outside {
            graph.set_input(consumer, slot, tail)?;
        }
    }
    Ok(())
}

/// Set the subgraph precision on Concats and intermediates and mark every
/// layer as handled
pub(crate) fn finish_subgraph(
    ctx: &mut TransformationContext<'_>,
    graph: &mut LptGraph,
    subgraph: &Subgraph,
    precision: ElementType,
    update_precisions: bool,
) -> Result<()> {
    for &layer in &subgraph.layers {
        if update_precisions && !graph.is_op(layer, OpType::FakeQuantize) {
            graph.set_output_precision(layer, precision)?;
        }
        ctx.mark_handled(graph, layer);
    }
    Ok(())
}

/// Dequantization reaching `layer`, resolved through Concats and intermediates
fn fill_dequantization(graph: &LptGraph, layer: NodeId, cache: &DequantizationCache) -> Result<DequantizationValues> {
    if let Some(values) = cache.get(layer) {
        return Ok(values.clone());
    }
    let not_found = || LptError::DequantizationNotFound(graph.name(layer).to_string());

    match graph.node(layer).map(|n| &n.op) {
        Some(Op::Concat { axis }) => {
            let rank = graph.shape(layer).map(<[usize]>::len).ok_or_else(not_found)?;
            let mut parts = Vec::new();
            for (source, _) in graph.inputs(layer) {
                let channels = graph
                    .shape(source)
                    .and_then(|shape| shape.get(*axis).copied())
                    .ok_or_else(not_found)?;
                parts.push((fill_dequantization(graph, source, cache)?, channels));
            }
            concatenate_values(&parts, *axis, rank)
        }
        Some(Op::FakeQuantize { .. }) | None => Err(not_found()),
        Some(_) => {
            let parent = graph.input_node(layer, 0).ok_or_else(not_found)?;
            fill_dequantization(graph, parent, cache)
        }
    }
}

/// Concatenate per-input dequantization constants along `axis`
fn concatenate_values(parts: &[(DequantizationValues, usize)], axis: usize, rank: usize) -> Result<DequantizationValues> {
    let (first, _) = parts
        .first()
        .ok_or_else(|| LptError::DequantizationNotFound("empty Concat".to_string()))?;
    let total: usize = parts.iter().map(|(_, channels)| channels).sum();
    let has_shift = parts.iter().any(|(values, _)| values.shift.is_some());

    let mut scale = Vec::with_capacity(total);
    let mut shift = Vec::with_capacity(total);
    for (values, channels) in parts {
        scale.extend(per_channel(&values.scale, *channels, axis, rank)?);
        match &values.shift {
            Some(values) => shift.extend(per_channel(values, *channels, axis, rank)?),
            None => shift.extend(std::iter::repeat(0.0).take(*channels)),
        }
    }

    let mut shape = vec![1; rank];
    shape[axis] = total;
    let scale = Tensor::from_vec(first.original_type, &shape, scale)?;
    let shift = if has_shift {
        let shift = Tensor::from_vec(first.original_type, &shape, shift)?;
        (!is_zero_tensor(&shift)).then(|| to_scalar_if_possible(&shift))
    } else {
        None
    };

    Ok(DequantizationValues {
        original_type: first.original_type,
        precision: first.precision,
        shift,
        scale: to_scalar_if_possible(&scale),
    })
}

/// One value per channel along `axis`
fn per_channel(tensor: &Tensor, channels: usize, axis: usize, rank: usize) -> Result<Vec<f32>> {
    if tensor.len() == 1 {
        return Ok(vec![tensor.first().unwrap_or(0.0); channels]);
    }
    let mut shape = vec![1; rank];
    shape[axis] = channels;
    let view = tensor.values().broadcast(IxDyn(&shape)).ok_or_else(|| {
        LptError::UnsupportedConfiguration(format!(
            "dequantization constant of shape {:?} is not per-channel along axis {}",
            tensor.shape(),
            axis
        ))
    })?;
    Ok(view.iter().copied().collect())
}
