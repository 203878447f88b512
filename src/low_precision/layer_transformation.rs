//! Shared transformation contract
//!
//! Every low-precision rewrite implements [`LayerTransformation`]. The
//! orchestrator hands each one a [`TransformationContext`], which answers
//! registry-wide questions about other operations and carries the per-run
//! idempotency guard.

use super::registry::TransformationRegistry;
use crate::error::Result;
use crate::graph::{ElementType, LptGraph, NodeId, Op, OpType};
use rustc_hash::FxHashSet;

/// Ratio tolerance when deciding whether a signed interval is symmetric
const ASYMMETRY_THRESHOLD: f32 = 1e-2;

/// Parameters shared by all transformations
#[derive(Debug, Clone, PartialEq)]
pub struct LayerParams {
    /// Set low-precision output types on rewritten nodes
    pub update_precisions: bool,
    /// Allow dequantization chains with a zero point
    pub support_asymmetric_quantization: bool,
    /// Precisions accepted on activations, in preference order
    pub precisions_on_activations: Vec<ElementType>,
}

impl Default for LayerParams {
    fn default() -> Self {
        Self {
            update_precisions: true,
            support_asymmetric_quantization: true,
            precisions_on_activations: vec![ElementType::U8, ElementType::I8],
        }
    }
}

impl LayerParams {
    pub fn with_update_precisions(mut self, update_precisions: bool) -> Self {
        self.update_precisions = update_precisions;
        self
    }

    pub fn with_support_asymmetric_quantization(mut self, support: bool) -> Self {
        self.support_asymmetric_quantization = support;
        self
    }

    pub fn with_precisions_on_activations(mut self, precisions: Vec<ElementType>) -> Self {
        self.precisions_on_activations = precisions;
        self
    }
}

/// A graph rewrite triggered by one operation kind
///
/// `transform` returns `true` if the graph was modified.
pub trait LayerTransformation {
    /// Name for logging and statistics
    fn name(&self) -> &str;

    /// Operation kind that triggers this transformation
    fn matched_op(&self) -> OpType;

    fn params(&self) -> &LayerParams;

    fn params_mut(&mut self) -> &mut LayerParams;

    /// Try to rewrite `node`
    fn transform(&self, ctx: &mut TransformationContext<'_>, graph: &mut LptGraph, node: NodeId) -> Result<bool>;

    /// Whether the operation keeps its input precision on the output
    fn is_precision_preserved(&self, graph: &LptGraph, node: NodeId) -> bool;

    /// Whether the operation can run on quantized inputs
    fn is_quantized(&self, _graph: &LptGraph, _node: NodeId) -> bool {
        true
    }

    fn precisions_on_activations(&self) -> &[ElementType] {
        &self.params().precisions_on_activations
    }
}

/// State shared by all transformations during one run
pub struct TransformationContext<'a> {
    registry: &'a TransformationRegistry,
    handled: FxHashSet<u64>,
}

impl<'a> TransformationContext<'a> {
    pub fn new(registry: &'a TransformationRegistry) -> Self {
        Self {
            registry,
            handled: FxHashSet::default(),
        }
    }

    pub fn registry(&self) -> &TransformationRegistry {
        self.registry
    }

    /// Any registered transformation for the node's kind reports it quantized
    pub fn is_quantized(&self, graph: &LptGraph, node: NodeId) -> bool {
        match graph.op_type(node) {
            Some(op_type) => self
                .registry
                .find(op_type)
                .iter()
                .any(|t| t.is_quantized(graph, node)),
            None => false,
        }
    }

    /// All registered transformations for the node's kind agree that it
    /// preserves precision; `false` when none is registered
    pub fn is_precision_preserved(&self, graph: &LptGraph, node: NodeId) -> bool {
        let Some(op_type) = graph.op_type(node) else {
            return false;
        };
        let transformations = self.registry.find(op_type);
        !transformations.is_empty() && transformations.iter().all(|t| t.is_precision_preserved(graph, node))
    }

    /// Intersection of the precisions every matching transformation supports
    pub fn precisions_on_activations(&self, graph: &LptGraph, node: NodeId) -> Vec<ElementType> {
        let Some(op_type) = graph.op_type(node) else {
            return Vec::new();
        };
        let transformations = self.registry.find(op_type);
        let Some((first, rest)) = transformations.split_first() else {
            return Vec::new();
        };

        let mut precisions: Vec<ElementType> = Vec::new();
        for &precision in first.precisions_on_activations() {
            if !precisions.contains(&precision) {
                precisions.push(precision);
            }
        }
        precisions.retain(|p| rest.iter().all(|t| t.precisions_on_activations().contains(p)));
        precisions
    }

    /// Record a node as already rewritten in this run
    pub fn mark_handled(&mut self, graph: &LptGraph, node: NodeId) {
        if let Some(uid) = graph.uid(node) {
            self.handled.insert(uid);
        }
    }

    pub fn is_handled(&self, graph: &LptGraph, node: NodeId) -> bool {
        graph.uid(node).map(|uid| self.handled.contains(&uid)).unwrap_or(false)
    }
}

/// Constant limits of a FakeQuantize
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizationDetails {
    pub levels: usize,
    pub input_low: Vec<f32>,
    pub input_high: Vec<f32>,
    pub output_low: Vec<f32>,
    pub output_high: Vec<f32>,
}

impl QuantizationDetails {
    /// Read the limits of `fq`; `None` unless all four limits are constants
    pub fn from_fake_quantize(graph: &LptGraph, fq: NodeId) -> Option<Self> {
        let levels = match graph.node(fq)?.op {
            Op::FakeQuantize { levels } => levels,
            _ => return None,
        };
        let limit = |slot: usize| -> Option<Vec<f32>> {
            let source = graph.input_node(fq, slot)?;
            graph.constant(source).map(|t| t.to_vec())
        };

        Some(Self {
            levels,
            input_low: limit(1)?,
            input_high: limit(2)?,
            output_low: limit(3)?,
            output_high: limit(4)?,
        })
    }

    pub fn is_supported_levels(levels: usize) -> bool {
        levels == 255 || levels == 256
    }

    /// Every limit holds a single distinct value
    pub fn is_per_tensor(&self) -> bool {
        let uniform = |values: &[f32]| values.windows(2).all(|w| w[0] == w[1]) && !values.is_empty();
        uniform(&self.input_low)
            && uniform(&self.input_high)
            && uniform(&self.output_low)
            && uniform(&self.output_high)
    }

    pub fn output_low_min(&self) -> f32 {
        self.output_low.iter().copied().fold(f32::INFINITY, f32::min)
    }

    pub fn output_high_max(&self) -> f32 {
        self.output_high.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }
}

/// Target low precision and its numeric range for one quantized tensor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPrecision {
    pub precision: ElementType,
    pub min: f32,
    pub max: f32,
    pub has_zero_point: bool,
}

impl DataPrecision {
    /// Representable range of a low precision with `levels` quantization levels
    pub fn range(precision: ElementType, levels: usize) -> Option<(f32, f32)> {
        let span = levels.checked_sub(1)? as f32;
        match precision {
            ElementType::U8 => Some((0.0, span)),
            ElementType::I8 => {
                let min = -((levels / 2) as f32);
                Some((min, min + span))
            }
            _ => None,
        }
    }

    /// Resolve the precision for a FakeQuantize
    ///
    /// Returns `None` when the levels are unsupported, no allowed precision
    /// fits, or a zero point is needed but asymmetric quantization is off.
    pub fn resolve(details: &QuantizationDetails, params: &LayerParams) -> Option<Self> {
        if !QuantizationDetails::is_supported_levels(details.levels) {
            return None;
        }

        let unsigned = details.output_low.iter().all(|&low| low >= 0.0);
        let preferred = if unsigned { ElementType::U8 } else { ElementType::I8 };
        let (min, max) = Self::range(preferred, details.levels)?;

        let mut has_zero_point = if unsigned {
            details.output_low.iter().any(|&low| low != 0.0)
        } else {
            let expected = min / max;
            details
                .output_low
                .iter()
                .zip(&details.output_high)
                .any(|(&low, &high)| high == 0.0 || (low / high - expected).abs() > ASYMMETRY_THRESHOLD)
        };

        let precision = if params.precisions_on_activations.contains(&preferred) {
            preferred
        } else {
            has_zero_point = true;
            *params.precisions_on_activations.first()?
        };
        let (min, max) = Self::range(precision, details.levels)?;

        if has_zero_point && !params.support_asymmetric_quantization {
            return None;
        }

        Some(Self {
            precision,
            min,
            max,
            has_zero_point,
        })
    }
}
