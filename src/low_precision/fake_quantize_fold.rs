//! Constant folding of FakeQuantize
//!
//! Evaluates the quantization-simulation function on constant data. Limits
//! are either a single value or one value per leading (channel) dimension.

use crate::error::{LptError, Result};
use crate::graph::{ElementType, LptGraph, NodeId, Op, Tensor};
use ndarray::{ArrayD, IxDyn};

const MAX_FOLD_RANK: usize = 5;

/// Limits of a FakeQuantize being folded
#[derive(Debug, Clone, Copy)]
pub struct FoldLimits<'a> {
    pub input_low: &'a Tensor,
    pub input_high: &'a Tensor,
    pub output_low: &'a Tensor,
    pub output_high: &'a Tensor,
}

impl FoldLimits<'_> {
    /// `levels=256, [0, 254] -> [-127, 127]`, which reduces to `x + output_low`
    fn is_signed_fast_path(&self, levels: usize) -> bool {
        levels == 256
            && self.input_low.is_equal_to(0.0)
            && self.input_high.is_equal_to(254.0)
            && self.output_low.is_equal_to(-127.0)
            && self.output_high.is_equal_to(127.0)
    }
}

/// Fold `fq` when its data and limits are constants
///
/// `round_values` defaults to whether the FakeQuantize output type is
/// integral. Returns `Ok(None)` when any input is not constant.
pub fn fold_fake_quantize(graph: &LptGraph, fq: NodeId, round_values: Option<bool>) -> Result<Option<Tensor>> {
    let node = graph
        .node(fq)
        .ok_or_else(|| LptError::Graph(format!("FakeQuantize {:?} does not exist", fq)))?;
    let levels = match node.op {
        Op::FakeQuantize { levels } => levels,
        _ => return Err(LptError::UnexpectedOperation(format!("{} is not a FakeQuantize", node.name))),
    };

    let constant = |slot: usize| graph.input_node(fq, slot).and_then(|source| graph.constant(source));
    let (Some(data), Some(input_low), Some(input_high), Some(output_low), Some(output_high)) =
        (constant(0), constant(1), constant(2), constant(3), constant(4))
    else {
        return Ok(None);
    };

    let output_type = node.element_type();
    let limits = FoldLimits {
        input_low,
        input_high,
        output_low,
        output_high,
    };
    let round_values = round_values.unwrap_or_else(|| output_type.is_integral());

    fold_values(&node.name, data, levels, limits, output_type, round_values).map(Some)
}

/// Apply FakeQuantize to constant `data`
///
/// ```text
/// v <= input_low  -> output_low
/// v >  input_high -> output_high
/// otherwise       -> round((v - il) / (ih - il) * (levels - 1)) / (levels - 1) * (oh - ol) + ol
/// ```
pub fn fold_values(
    name: &str,
    data: &Tensor,
    levels: usize,
    limits: FoldLimits<'_>,
    output_type: ElementType,
    round_values: bool,
) -> Result<Tensor> {
    if limits.is_signed_fast_path(levels) {
        let offset = limits.output_low.first().unwrap_or(0.0);
        return Ok(Tensor::new(output_type, data.values().mapv(|v| v + offset)));
    }

    if levels < 2 {
        return Err(LptError::UnsupportedConfiguration(format!(
            "{} has {} quantization levels",
            name, levels
        )));
    }

    let shape = data.shape();
    if shape.is_empty() || shape.len() > MAX_FOLD_RANK {
        return Err(LptError::UnexpectedRank {
            node: name.to_string(),
            rank: shape.len(),
        });
    }

    let channels = shape[0];
    let check = |limit: &'static str, tensor: &Tensor| -> Result<Vec<f32>> {
        let count = tensor.len();
        if count != 1 && count != channels {
            return Err(LptError::LimitCardinality {
                node: name.to_string(),
                limit,
                count,
                channels,
            });
        }
        Ok(tensor.to_vec())
    };
    let input_low = check("input low", limits.input_low)?;
    let input_high = check("input high", limits.input_high)?;
    let output_low = check("output low", limits.output_low)?;
    let output_high = check("output high", limits.output_high)?;

    let per_channel = |values: &[f32], channel: usize| -> f32 {
        if values.len() == 1 {
            values[0]
        } else {
            values[channel]
        }
    };
    let round = |v: f32| if round_values { v.round() } else { v };

    let inner = if channels == 0 { 1 } else { data.len() / channels };
    let levels_1 = (levels - 1) as f32;

    let folded: Vec<f32> = data
        .values()
        .iter()
        .enumerate()
        .map(|(index, &value)| {
            let channel = index / inner.max(1);
            let il = per_channel(&input_low, channel);
            let ih = per_channel(&input_high, channel);
            let ol = per_channel(&output_low, channel);
            let oh = per_channel(&output_high, channel);

            if value <= il {
                round(ol)
            } else if value > ih {
                round(oh)
            } else {
                round(((value - il) / (ih - il) * levels_1).round() / levels_1 * (oh - ol) + ol)
            }
        })
        .collect();

    let values = ArrayD::from_shape_vec(IxDyn(shape), folded).map_err(|e| LptError::Graph(e.to_string()))?;
    Ok(Tensor::new(output_type, values))
}
