//! Dequantization algebra
//!
//! Extracts, builds, relocates and simplifies `Convert -> Subtract -> Multiply`
//! chains on a live graph. Absence of a pattern is reported as data (`None` or
//! an empty chain), never as an error.

use super::dequantization::{DequantizationValues, FakeQuantizeDequantization};
use super::fake_quantize_fold::fold_fake_quantize;
use crate::error::{LptError, Result};
use crate::graph::fold::{fold_convert, fold_divide, fold_multiply, fold_subtract};
use crate::graph::{ElementType, LptGraph, NodeId, Op, OpType, Tensor};
use rustc_hash::FxHashSet;
use tracing::debug;

/// Maximum per-element error accepted when rounding a constant to an integer type
pub const ROUNDING_TOLERANCE: f32 = 0.1;

/// Values this close to zero make a shift redundant
const ZERO_TOLERANCE: f32 = 1e-6;

/// First constant input of `node`
pub fn get_constant_input(graph: &LptGraph, node: NodeId) -> Option<NodeId> {
    graph
        .inputs(node)
        .into_iter()
        .map(|(source, _)| source)
        .find(|&source| graph.is_constant(source))
}

/// Constant operand of a two-input op together with the slot of the data operand
///
/// Exactly one side must be constant.
pub(crate) fn binary_constant(graph: &LptGraph, node: NodeId) -> Option<(usize, NodeId)> {
    if graph.input_count(node) < 2 {
        return None;
    }
    let lhs = graph.input_node(node, 0)?;
    let rhs = graph.input_node(node, 1)?;
    match (graph.is_constant(lhs), graph.is_constant(rhs)) {
        (false, true) => Some((0, rhs)),
        (true, false) => Some((1, lhs)),
        _ => None,
    }
}

/// Dequantization chain feeding `input_index` of `node`
///
/// Walks back through an optional constant Multiply, an optional constant
/// Subtract and an optional Convert. Unmatched stages stay empty.
pub fn get_dequantization(graph: &LptGraph, node: NodeId, input_index: usize) -> FakeQuantizeDequantization {
    let Some(mut data) = graph.input(node, input_index) else {
        return FakeQuantizeDequantization::empty((node, 0));
    };
    let mut chain = FakeQuantizeDequantization::empty(data);

    if graph.is_op(data.0, OpType::Multiply) {
        if let Some((data_slot, _)) = binary_constant(graph, data.0) {
            if let Some(parent) = graph.input(data.0, data_slot) {
                chain.multiply = Some(data.0);
                data = parent;
            }
        }
    }

    if graph.is_op(data.0, OpType::Subtract) {
        if let Some((0, _)) = binary_constant(graph, data.0) {
            if let Some(parent) = graph.input(data.0, 0) {
                chain.subtract = Some(data.0);
                data = parent;
            }
        }
    }

    if graph.is_op(data.0, OpType::Convert) {
        if let Some(parent) = graph.input(data.0, 0) {
            chain.convert = Some(data.0);
            data = parent;
        }
    }

    chain.data = data;
    chain
}

/// Every element is within tolerance of zero
pub(crate) fn is_zero_tensor(tensor: &Tensor) -> bool {
    !tensor.is_empty() && tensor.values().iter().all(|v| v.abs() <= ZERO_TOLERANCE)
}

/// Dequantization restoring the output range of `fq` from `[min, max]`
///
/// `scale = (oh - ol) / (max - min)` and, with a zero point,
/// `shift = (min * oh - max * ol) / (oh - ol)`. A shift that is zero
/// everywhere is dropped.
pub fn create_dequantization_from_fake_quantize(
    graph: &LptGraph,
    fq: NodeId,
    precision: ElementType,
    min: f32,
    max: f32,
    has_zero_point: bool,
) -> Result<DequantizationValues> {
    let node = graph
        .node(fq)
        .ok_or_else(|| LptError::Graph(format!("FakeQuantize {:?} does not exist", fq)))?;
    let limit = |slot: usize, what: &str| {
        graph
            .input_node(fq, slot)
            .and_then(|source| graph.constant(source))
            .ok_or_else(|| LptError::UnexpectedOperation(format!("{} has a non-constant {}", node.name, what)))
    };
    let output_low = limit(3, "output low")?;
    let output_high = limit(4, "output high")?;
    let original_type = node.element_type();

    let range = fold_subtract(output_high, output_low)?;
    let scale = fold_divide(&range, &Tensor::scalar(original_type, max - min))?;

    let shift = if has_zero_point {
        let high_part = fold_multiply(output_high, &Tensor::scalar(original_type, min))?;
        let low_part = fold_multiply(output_low, &Tensor::scalar(original_type, max))?;
        let shift = fold_divide(&fold_subtract(&high_part, &low_part)?, &range)?;
        if is_zero_tensor(&shift) {
            None
        } else {
            Some(shift)
        }
    } else {
        None
    };

    Ok(DequantizationValues {
        original_type,
        precision,
        shift,
        scale,
    })
}

/// Split a FakeQuantize into a narrowed quantize and a dequantization chain
///
/// The quantize emits `[min, max]`; it is folded into a constant when its
/// data is constant. Consumers of `fq` are moved to the chain tail.
/// Returns `(quantize, tail)`.
pub fn decompose_fake_quantize(
    graph: &mut LptGraph,
    fq: NodeId,
    precision: ElementType,
    min: f32,
    max: f32,
    has_zero_point: bool,
    update_precision: bool,
) -> Result<(NodeId, NodeId)> {
    let node = graph
        .node(fq)
        .cloned()
        .ok_or_else(|| LptError::Graph(format!("FakeQuantize {:?} does not exist", fq)))?;
    let levels = match node.op {
        Op::FakeQuantize { levels } => levels,
        _ => return Err(LptError::UnexpectedOperation(format!("{} is not a FakeQuantize", node.name))),
    };
    let inputs = graph.inputs(fq);
    if inputs.len() != 5 {
        return Err(LptError::UnexpectedOperation(format!(
            "{} has {} inputs",
            node.name,
            inputs.len()
        )));
    }

    let values = create_dequantization_from_fake_quantize(graph, fq, precision, min, max, has_zero_point)?;

    let real_type = node.element_type();
    let new_low = graph.add_op(Op::Constant(Tensor::scalar(real_type, min))).finish()?;
    let new_high = graph.add_op(Op::Constant(Tensor::scalar(real_type, max))).finish()?;
    let quantize_name = format!("{}_original", node.name);
    let new_fq = graph
        .add_op(Op::FakeQuantize { levels })
        .name(quantize_name.clone())
        .input(inputs[0].0, inputs[0].1, 0)
        .input(inputs[1].0, inputs[1].1, 1)
        .input(inputs[2].0, inputs[2].1, 2)
        .input(new_low, 0, 3)
        .input(new_high, 0, 4)
        .relaxed()
        .finish()?;

    let quantize = match fold_fake_quantize(graph, new_fq, Some(true))? {
        Some(folded) => {
            let folded = if update_precision {
                fold_convert(&folded, precision)
            } else {
                folded
            };
            let constant = graph.add_op(Op::Constant(folded)).name(quantize_name.clone()).finish()?;
            graph.prune(new_fq);
            constant
        }
        None => {
            if update_precision {
                graph.set_output_precision(new_fq, precision)?;
            }
            new_fq
        }
    };

    let chain = values.materialize(graph, (quantize, 0), &quantize_name, update_precision)?;
    let tail = chain.tail().0;
    graph.replace_node(fq, tail)?;

    debug!(
        "Decomposed {} into {} ({}) with dequantization {}",
        node.name,
        quantize_name,
        precision,
        graph.name(tail)
    );

    Ok((quantize, tail))
}

/// Rebuild `fq` with output limits `[min, max]` and output `precision`
///
/// The replacement keeps the original name.
pub fn update_fake_quantize(
    graph: &mut LptGraph,
    fq: NodeId,
    precision: ElementType,
    min: f32,
    max: f32,
) -> Result<NodeId> {
    let node = graph
        .node(fq)
        .cloned()
        .ok_or_else(|| LptError::Graph(format!("FakeQuantize {:?} does not exist", fq)))?;
    let levels = match node.op {
        Op::FakeQuantize { levels } => levels,
        _ => return Err(LptError::UnexpectedOperation(format!("{} is not a FakeQuantize", node.name))),
    };
    let inputs = graph.inputs(fq);
    if inputs.len() != 5 {
        return Err(LptError::UnexpectedOperation(format!(
            "{} has {} inputs",
            node.name,
            inputs.len()
        )));
    }

    let new_low = graph
        .add_op(Op::Constant(Tensor::scalar(node.output_type, min)))
        .finish()?;
    let new_high = graph
        .add_op(Op::Constant(Tensor::scalar(node.output_type, max)))
        .finish()?;
    let new_fq = graph
        .add_op(Op::FakeQuantize { levels })
        .name(node.name.clone())
        .input(inputs[0].0, inputs[0].1, 0)
        .input(inputs[1].0, inputs[1].1, 1)
        .input(inputs[2].0, inputs[2].1, 2)
        .input(new_low, 0, 3)
        .input(new_high, 0, 4)
        .precision(precision)
        .finish()?;

    graph.replace_node(fq, new_fq)?;
    Ok(new_fq)
}

/// Move the dequantization feeding `op` to its output
///
/// `op` is cloned onto the raw data (or onto the Subtract when
/// `move_subtract` is false) and the chain is re-attached after the clone.
/// The caller guarantees that `op` commutes with the moved affine transform.
/// Returns `(new_op, tail)`.
pub fn move_dequantization_after(
    graph: &mut LptGraph,
    op: NodeId,
    dequantization: &FakeQuantizeDequantization,
    update_precision: bool,
    move_subtract: bool,
) -> Result<(NodeId, NodeId)> {
    let name = graph.name(op).to_string();
    let multiply = dequantization
        .multiply
        .ok_or_else(|| LptError::DequantizationNotFound(name.clone()))?;
    let scale = dequantization
        .multiply_constant(graph)
        .ok_or_else(|| LptError::DequantizationNotFound(name.clone()))?;
    let shift = dequantization.subtract_constant(graph);
    let index = get_input_index(graph, multiply, op)?;

    let mut inputs = graph.inputs(op);
    inputs[index] = match (move_subtract, dequantization.subtract) {
        (false, Some(subtract)) => (subtract, 0),
        _ => dequantization.data,
    };

    let new_op = graph.clone_with_new_inputs(op, &inputs)?;
    if update_precision {
        if !graph.is_type_relaxed(new_op) {
            return Err(LptError::PrecisionOverrideUnsupported(name));
        }
        let input_type = graph
            .element_type(inputs[index].0)
            .ok_or_else(|| LptError::Graph(format!("{} lost its input", name)))?;
        graph.override_output_type(new_op, input_type)?;
    }

    let mut parent = new_op;
    let multiply_type = graph
        .element_type(multiply)
        .ok_or_else(|| LptError::Graph(format!("{} lost its dequantization", name)))?;
    if graph.element_type(new_op) != Some(multiply_type) {
        let destination = dequantization
            .convert
            .and_then(|convert| graph.element_type(convert))
            .unwrap_or(multiply_type);
        parent = graph
            .add_op(Op::Convert { destination })
            .name(format!("{}_Convert", name))
            .inputs(&[parent])
            .finish()?;
    }

    if move_subtract {
        if let Some(shift) = shift {
            parent = graph
                .add_op(Op::Subtract)
                .name(format!("{}_Subtract", name))
                .inputs(&[parent, shift])
                .finish()?;
        }
    }

    let tail = graph
        .add_op(Op::Multiply)
        .name(format!("{}_Multiply", name))
        .inputs(&[parent, scale])
        .finish()?;

    graph.replace_node(op, tail)?;

    if !move_subtract {
        if let (Some(_), Some(subtract)) = (dequantization.convert, dequantization.subtract) {
            optimize_subtract(graph, subtract)?;
        }
    }

    debug!("Moved dequantization after {}", name);
    Ok((new_op, tail))
}

/// Push a Subtract before the Convert feeding it
///
/// Applies to `Subtract(Convert(x -> real), shift)` when `shift` rounds
/// into the type of `x`. Returns the replacement Subtract, or `None` when
/// nothing changed.
pub fn optimize_subtract(graph: &mut LptGraph, subtract: NodeId) -> Result<Option<NodeId>> {
    if !graph.is_op(subtract, OpType::Subtract) {
        return Ok(None);
    }
    let Some(convert) = graph.input_node(subtract, 0).filter(|&n| graph.is_op(n, OpType::Convert)) else {
        return Ok(None);
    };
    let Some(convert_type) = graph.element_type(convert).filter(ElementType::is_real) else {
        return Ok(None);
    };
    let Some(data) = graph.input(convert, 0) else {
        return Ok(None);
    };
    let Some(data_type) = graph.element_type(data.0) else {
        return Ok(None);
    };
    let Some(shift) = graph.input_node(subtract, 1).and_then(|n| graph.constant(n)).cloned() else {
        return Ok(None);
    };

    let rounded = round_with_tolerance(&shift, data_type, ROUNDING_TOLERANCE);
    if rounded.element_type() != data_type {
        return Ok(None);
    }

    let name = graph.name(subtract).to_string();
    let rounded = graph.add_op(Op::Constant(rounded)).finish()?;
    let replacement = graph
        .add_op(Op::Subtract)
        .name(name.clone())
        .input(data.0, data.1, 0)
        .input(rounded, 0, 1)
        .precision(convert_type)
        .finish()?;
    graph.replace_node(subtract, replacement)?;

    debug!("Moved {} before its Convert", name);
    Ok(Some(replacement))
}

/// Merge a constant Multiply with the constant Multiply consuming it
///
/// Both multiplies and both constants must have a single consumer. Returns
/// the merged Multiply, or `None` when nothing changed.
pub fn optimize_multiplies_after(graph: &mut LptGraph, multiply: NodeId) -> Result<Option<NodeId>> {
    if !graph.is_op(multiply, OpType::Multiply) || graph.consumer_count(multiply) != 1 {
        return Ok(None);
    }
    let Some((data_slot, constant)) = binary_constant(graph, multiply) else {
        return Ok(None);
    };
    if graph.consumer_count(constant) != 1 {
        return Ok(None);
    }

    let Some(&next) = graph.consumer_nodes(multiply).first() else {
        return Ok(None);
    };
    if !graph.is_op(next, OpType::Multiply) {
        return Ok(None);
    }
    let Some((_, next_constant)) = binary_constant(graph, next) else {
        return Ok(None);
    };
    if graph.consumer_count(next_constant) != 1 {
        return Ok(None);
    }

    let (Some(lhs), Some(rhs)) = (graph.constant(constant), graph.constant(next_constant)) else {
        return Ok(None);
    };
    let folded = fold_multiply(lhs, rhs)?;
    let data = graph
        .input(multiply, data_slot)
        .ok_or_else(|| LptError::Graph(format!("{} lost its data input", graph.name(multiply))))?;

    let name = graph.name(next).to_string();
    let precision = graph
        .node(next)
        .filter(|n| n.type_relaxed)
        .and_then(|n| n.precision_override);
    let folded = graph.add_op(Op::Constant(folded)).finish()?;
    let mut builder = graph
        .add_op(Op::Multiply)
        .name(name.clone())
        .input(data.0, data.1, 0)
        .input(folded, 0, 1);
    if let Some(precision) = precision {
        builder = builder.precision(precision);
    }
    let merged = builder.finish()?;
    graph.replace_node(next, merged)?;

    debug!("Merged {} into {}", graph.name(data.0), name);
    Ok(Some(merged))
}

/// Rewrite `x * a + b` as `(x + b / a) * a`
///
/// `multiply_branch` is the Add input fed by the Multiply. Returns the new
/// trailing Multiply.
pub fn swap_multiply_and_add(graph: &mut LptGraph, add: NodeId, multiply_branch: usize) -> Result<NodeId> {
    let name = graph.name(add).to_string();
    let unexpected = |what: &str| LptError::UnexpectedOperation(format!("{}: {}", name, what));

    let multiply = graph
        .input_node(add, multiply_branch)
        .filter(|&n| graph.is_op(n, OpType::Multiply))
        .ok_or_else(|| unexpected("branch is not a Multiply"))?;
    let (data_slot, scale) = binary_constant(graph, multiply).ok_or_else(|| unexpected("scale is not constant"))?;
    let bias = graph
        .input_node(add, 1 - multiply_branch.min(1))
        .filter(|&n| graph.is_constant(n))
        .ok_or_else(|| unexpected("bias is not constant"))?;
    let data = graph
        .input(multiply, data_slot)
        .ok_or_else(|| unexpected("multiply has no data input"))?;

    let (Some(scale_values), Some(bias_values)) = (graph.constant(scale), graph.constant(bias)) else {
        return Err(unexpected("constants disappeared"));
    };
    let shifted_bias = fold_divide(bias_values, scale_values)?;
    let add_precision = graph
        .element_type(add)
        .ok_or_else(|| unexpected("missing output type"))?;

    let shifted_bias = graph.add_op(Op::Constant(shifted_bias)).finish()?;
    let new_add = graph
        .add_op(Op::Add)
        .name(name.clone())
        .input(data.0, data.1, 0)
        .input(shifted_bias, 0, 1)
        .precision(add_precision)
        .finish()?;
    let new_multiply = graph
        .add_op(Op::Multiply)
        .name(format!("{}_Multiply", name))
        .inputs(&[new_add, scale])
        .finish()?;
    graph.replace_node(add, new_multiply)?;

    debug!("Swapped Multiply and Add at {}", name);
    Ok(new_multiply)
}

/// Convert a constant to `target`, nudging values by `{0, +0.5, -0.5, +1}`
///
/// The first offset whose result stays within `tolerance` of every original
/// element wins. If none does, `tensor` is returned unchanged.
pub fn round_with_tolerance(tensor: &Tensor, target: ElementType, tolerance: f32) -> Tensor {
    for offset in [0.0, 0.5, -0.5, 1.0] {
        let shifted = Tensor::new(tensor.element_type(), tensor.values().mapv(|v| v + offset));
        let candidate = fold_convert(&shifted, target);
        let within = candidate
            .values()
            .iter()
            .zip(tensor.values().iter())
            .all(|(converted, original)| (converted - original).abs() < tolerance);
        if within {
            return candidate;
        }
    }
    tensor.clone()
}

/// Consumers of `node`, looking through operations of the `except` kinds
pub fn get_children_recursively_except_types(graph: &LptGraph, node: NodeId, except: &[OpType]) -> Vec<NodeId> {
    let mut children = Vec::new();
    let mut visited = FxHashSet::default();
    let mut stack = graph.consumer_nodes(node);
    stack.reverse();

    while let Some(child) = stack.pop() {
        if !visited.insert(child) {
            continue;
        }
        match graph.op_type(child) {
            Some(op_type) if except.contains(&op_type) => {
                let mut grandchildren = graph.consumer_nodes(child);
                grandchildren.reverse();
                stack.extend(grandchildren);
            }
            Some(_) => children.push(child),
            None => {}
        }
    }

    children
}

/// Input slot of `child` fed by `parent`
pub fn get_input_index(graph: &LptGraph, parent: NodeId, child: NodeId) -> Result<usize> {
    graph
        .consumers(parent)
        .into_iter()
        .find(|&(target, _)| target == child)
        .map(|(_, slot)| usize::from(slot))
        .ok_or_else(|| {
            LptError::UnexpectedOperation(format!(
                "{} is not an input of {}",
                graph.name(parent),
                graph.name(child)
            ))
        })
}

/// Constant equal to zero everywhere
pub fn is_zero_const(graph: &LptGraph, node: NodeId) -> bool {
    graph.constant(node).map(|t| t.is_equal_to(0.0)).unwrap_or(false)
}

/// Reduce a scalar-like tensor to rank 0, otherwise keep it as is
pub fn to_scalar_if_possible(tensor: &Tensor) -> Tensor {
    tensor.to_scalar().unwrap_or_else(|| tensor.clone())
}
