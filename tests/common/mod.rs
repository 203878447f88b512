//! Shared helpers for integration tests

#![allow(dead_code)]

use hologram_lpt::graph::eval::evaluate_results;
use hologram_lpt::graph::{ElementType, LptGraph, NodeId, Op, Tensor};
use ndarray::{ArrayD, IxDyn};
use rustc_hash::FxHashMap;
use tracing_subscriber::EnvFilter;

/// Route `RUST_LOG`-filtered tracing output to the test harness
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

pub fn parameter(graph: &mut LptGraph, name: &str, shape: Vec<usize>) -> NodeId {
    graph
        .add_op(Op::Parameter)
        .name(name)
        .output(ElementType::F32, shape)
        .finish()
        .unwrap()
}

pub fn scalar(graph: &mut LptGraph, value: f32) -> NodeId {
    graph
        .add_op(Op::Constant(Tensor::scalar(ElementType::F32, value)))
        .finish()
        .unwrap()
}

pub fn constant(graph: &mut LptGraph, shape: &[usize], values: Vec<f32>) -> NodeId {
    graph
        .add_op(Op::Constant(Tensor::from_vec(ElementType::F32, shape, values).unwrap()))
        .finish()
        .unwrap()
}

/// FakeQuantize with identical input and output limits
pub fn fake_quantize(graph: &mut LptGraph, name: &str, data: NodeId, levels: usize, low: f32, high: f32) -> NodeId {
    let low = scalar(graph, low);
    let high = scalar(graph, high);
    graph
        .add_op(Op::FakeQuantize { levels })
        .name(name)
        .inputs(&[data, low, high, low, high])
        .finish()
        .unwrap()
}

pub fn feed(shape: &[usize], values: Vec<f32>) -> ArrayD<f32> {
    ArrayD::from_shape_vec(IxDyn(shape), values).unwrap()
}

pub fn run(graph: &LptGraph, feeds: &[(NodeId, ArrayD<f32>)]) -> Vec<ArrayD<f32>> {
    let feeds: FxHashMap<NodeId, ArrayD<f32>> = feeds.iter().cloned().collect();
    evaluate_results(graph, &feeds).unwrap()
}

pub fn assert_all_close(before: &[ArrayD<f32>], after: &[ArrayD<f32>], epsilon: f32) {
    assert_eq!(before.len(), after.len());
    for (b, a) in before.iter().zip(after) {
        assert_eq!(b.shape(), a.shape());
        for (x, y) in b.iter().zip(a.iter()) {
            approx::assert_abs_diff_eq!(x, y, epsilon = epsilon);
        }
    }
}
