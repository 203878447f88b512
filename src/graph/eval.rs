// Reference evaluator
//
// Interprets a graph on f32 arrays. It exists to check that rewrites keep the
// numeric result: evaluate before, transform, evaluate after, compare.
// Declared output types only matter for Convert (truncating, saturating) and
// for FakeQuantize, which emits integers when its output type is integral.

use super::fold::{broadcast_binary, broadcast_shape, convert_value, BinaryOp};
use super::ir::{LptGraph, NodeId, Op};
use anyhow::{anyhow, bail, Context, Result};
use ndarray::{concatenate, Array2, ArrayD, ArrayViewD, Axis, Ix2, IxDyn, Zip};
use rustc_hash::FxHashMap;

/// Evaluate every node of the graph
///
/// `feeds` supplies a value for every Parameter.
pub fn evaluate(graph: &LptGraph, feeds: &FxHashMap<NodeId, ArrayD<f32>>) -> Result<FxHashMap<NodeId, ArrayD<f32>>> {
    let mut values: FxHashMap<NodeId, ArrayD<f32>> = FxHashMap::default();

    for node_id in graph.topological_sort()? {
        let node = graph
            .node(node_id)
            .ok_or_else(|| anyhow!("Node {:?} disappeared during evaluation", node_id))?;
        let inputs: Vec<&ArrayD<f32>> = graph
            .inputs(node_id)
            .iter()
            .map(|(source, _)| values.get(source).ok_or_else(|| anyhow!("Missing value for input of {}", node.name)))
            .collect::<Result<_>>()?;

        let value = evaluate_node(&node.op, node.element_type().is_integral(), &inputs, feeds.get(&node_id))
            .with_context(|| format!("Evaluating {} ({})", node.name, node.op_type()))?;
        values.insert(node_id, value);
    }

    Ok(values)
}

/// Evaluate and return the values reaching each Result, in Result index order
pub fn evaluate_results(graph: &LptGraph, feeds: &FxHashMap<NodeId, ArrayD<f32>>) -> Result<Vec<ArrayD<f32>>> {
    let mut values = evaluate(graph, feeds)?;
    graph
        .results()
        .into_iter()
        .map(|result| values.remove(&result).ok_or_else(|| anyhow!("Result {:?} was not evaluated", result)))
        .collect()
}

fn evaluate_node(
    op: &Op,
    integral_output: bool,
    inputs: &[&ArrayD<f32>],
    feed: Option<&ArrayD<f32>>,
) -> Result<ArrayD<f32>> {
    let input = |i: usize| -> Result<&ArrayD<f32>> {
        inputs.get(i).copied().ok_or_else(|| anyhow!("Missing input {}", i))
    };

    match op {
        Op::Parameter => feed.cloned().ok_or_else(|| anyhow!("No value fed for parameter")),
        Op::Constant(tensor) => Ok(tensor.values().clone()),
        Op::Result => Ok(input(0)?.clone()),
        Op::Convert { destination } => Ok(input(0)?.mapv(|v| convert_value(v, *destination))),
        Op::Add => broadcast_binary(input(0)?, input(1)?, BinaryOp::Add),
        Op::Subtract => broadcast_binary(input(0)?, input(1)?, BinaryOp::Subtract),
        Op::Multiply => broadcast_binary(input(0)?, input(1)?, BinaryOp::Multiply),
        Op::Divide => broadcast_binary(input(0)?, input(1)?, BinaryOp::Divide),
        Op::Relu => Ok(input(0)?.mapv(|v| v.max(0.0))),
        Op::FakeQuantize { levels } => fake_quantize(
            input(0)?,
            [input(1)?, input(2)?, input(3)?, input(4)?],
            *levels,
            integral_output,
        ),
        Op::Concat { axis } => {
            let views: Vec<_> = inputs.iter().map(|a| a.view()).collect();
            Ok(concatenate(Axis(*axis), &views)?)
        }
        Op::MatMul => {
            let a = input(0)?.view().into_dimensionality::<Ix2>()?;
            let b = input(1)?.view().into_dimensionality::<Ix2>()?;
            let product: Array2<f32> = a.dot(&b);
            Ok(product.into_dyn())
        }
        Op::MaxPool { kernel } => pool(input(0)?, *kernel, |window| {
            window.iter().copied().fold(f32::NEG_INFINITY, f32::max)
        }),
        Op::AvgPool { kernel } => pool(input(0)?, *kernel, |window| {
            window.iter().sum::<f32>() / window.len() as f32
        }),
        Op::Reshape { shape } => Ok(input(0)?.as_standard_layout().into_owned().into_shape(IxDyn(shape))?),
        Op::Squeeze { axes } => {
            let mut value = input(0)?.clone();
            let mut sorted = axes.clone();
            sorted.sort_unstable_by(|a, b| b.cmp(a));
            for axis in sorted {
                value = value.index_axis_move(Axis(axis), 0);
            }
            Ok(value)
        }
        Op::Unsqueeze { axes } => {
            let mut value = input(0)?.clone();
            let mut sorted = axes.clone();
            sorted.sort_unstable();
            for axis in sorted {
                value = value.insert_axis(Axis(axis));
            }
            Ok(value)
        }
        Op::Transpose { order } => Ok(input(0)?.clone().permuted_axes(IxDyn(order))),
        Op::Convolution | Op::GroupConvolution | Op::Interpolate { .. } => {
            bail!("{} is not supported by the reference evaluator", op.op_type())
        }
    }
}

/// FakeQuantize with numpy-broadcast limits
fn fake_quantize(data: &ArrayD<f32>, limits: [&ArrayD<f32>; 4], levels: usize, round_output: bool) -> Result<ArrayD<f32>> {
    if levels < 2 {
        bail!("FakeQuantize needs at least 2 levels, got {}", levels);
    }
    let mut shape = data.shape().to_vec();
    for limit in limits {
        shape = broadcast_shape(&shape, limit.shape())
            .ok_or_else(|| anyhow!("Limit shape {:?} does not broadcast to {:?}", limit.shape(), data.shape()))?;
    }
    let (x, in_low, in_high, out_low, out_high) = (
        broadcast_view(data, &shape)?,
        broadcast_view(limits[0], &shape)?,
        broadcast_view(limits[1], &shape)?,
        broadcast_view(limits[2], &shape)?,
        broadcast_view(limits[3], &shape)?,
    );
    let levels_1 = (levels - 1) as f32;

    let mut result = ArrayD::zeros(IxDyn(&shape));
    Zip::from(&mut result)
        .and(&x)
        .and(&in_low)
        .and(&in_high)
        .and(&out_low)
        .and(&out_high)
        .for_each(|out, &v, &il, &ih, &ol, &oh| {
            let value = if v <= il {
                ol
            } else if v > ih {
                oh
            } else {
                ((v - il) / (ih - il) * levels_1).round() / levels_1 * (oh - ol) + ol
            };
            *out = if round_output { value.round() } else { value };
        });
    Ok(result)
}

fn broadcast_view<'a>(a: &'a ArrayD<f32>, shape: &[usize]) -> Result<ArrayViewD<'a, f32>> {
    a.broadcast(IxDyn(shape))
        .ok_or_else(|| anyhow!("Cannot broadcast {:?} to {:?}", a.shape(), shape))
}

/// Non-overlapping 2-D pooling over NCHW input
fn pool(data: &ArrayD<f32>, kernel: [usize; 2], reduce: impl Fn(&[f32]) -> f32) -> Result<ArrayD<f32>> {
    let shape = data.shape();
    if shape.len() != 4 {
        bail!("Pooling expects NCHW input, got {:?}", shape);
    }
    let (n, c, h, w) = (shape[0], shape[1], shape[2], shape[3]);
    let (kh, kw) = (kernel[0], kernel[1]);
    let (oh, ow) = (h / kh, w / kw);

    let mut result = ArrayD::zeros(IxDyn(&[n, c, oh, ow]));
    let mut window = Vec::with_capacity(kh * kw);
    for b in 0..n {
        for ch in 0..c {
            for y in 0..oh {
                for x in 0..ow {
                    window.clear();
                    for dy in 0..kh {
                        for dx in 0..kw {
                            window.push(data[IxDyn(&[b, ch, y * kh + dy, x * kw + dx])]);
                        }
                    }
                    result[IxDyn(&[b, ch, y, x])] = reduce(&window);
                }
            }
        }
    }
    Ok(result)
}
