//! Concat subgraphs through the full transformer

mod common;

use common::*;
use hologram_lpt::graph::{ElementType, LptGraph, NodeId, Op, OpType, Tensor};
use hologram_lpt::low_precision::{
    is_multi_channel, ConcatTransformation, LayerParams, LowPrecisionTransformer, TransformationRegistry,
};

struct ConcatNetwork {
    inputs: [NodeId; 2],
    concat: NodeId,
    result: NodeId,
}

/// Two 1x1x2x2 branches quantized to `[0, 2.55]` and `[-1.28, 1.27]`
fn concat_network(graph: &mut LptGraph) -> ConcatNetwork {
    let in1 = parameter(graph, "in1", vec![1, 1, 2, 2]);
    let in2 = parameter(graph, "in2", vec![1, 1, 2, 2]);
    let fq1 = fake_quantize(graph, "fq1", in1, 256, 0.0, 2.55);
    let fq2 = fake_quantize(graph, "fq2", in2, 256, -1.28, 1.27);
    let concat = graph
        .add_op(Op::Concat { axis: 1 })
        .name("concat")
        .inputs(&[fq1, fq2])
        .finish()
        .unwrap();
    let result = graph.add_op(Op::Result).inputs(&[concat]).finish().unwrap();
    ConcatNetwork {
        inputs: [in1, in2],
        concat,
        result,
    }
}

fn feeds(network: &ConcatNetwork) -> Vec<(NodeId, ndarray::ArrayD<f32>)> {
    vec![
        (network.inputs[0], feed(&[1, 1, 2, 2], vec![0.0, 0.4, 1.3, 3.0])),
        (network.inputs[1], feed(&[1, 1, 2, 2], vec![-2.0, -0.2, 0.3, 1.1])),
    ]
}

fn convolution(graph: &mut LptGraph, data: NodeId) -> NodeId {
    let weights = graph
        .add_op(Op::Constant(
            Tensor::from_vec(ElementType::F32, &[1, 2, 1, 1], vec![1.0, 1.0]).unwrap(),
        ))
        .finish()
        .unwrap();
    graph
        .add_op(Op::Convolution)
        .inputs(&[data, weights])
        .finish()
        .unwrap()
}

#[test]
fn test_multi_channel_detection() {
    let mut graph = LptGraph::new();
    let network = concat_network(&mut graph);
    assert!(is_multi_channel(&graph, &[network.concat]));

    // Pooling and resampling are looked through
    let pool = graph
        .add_op(Op::AvgPool { kernel: [1, 1] })
        .inputs(&[network.concat])
        .finish()
        .unwrap();
    let resize = graph
        .add_op(Op::Interpolate { scale: 2 })
        .inputs(&[pool])
        .finish()
        .unwrap();
    convolution(&mut graph, resize);
    assert!(!is_multi_channel(&graph, &[network.concat]));
}

#[test]
fn test_unsigned_and_signed_branches_share_u8() {
    init_tracing();
    let mut graph = LptGraph::new();
    let network = concat_network(&mut graph);
    let before = run(&graph, &feeds(&network));

    let stats = LowPrecisionTransformer::new().transform(&mut graph).unwrap();
    assert_eq!(stats.rewrites("BranchSpecific"), 1);

    let concat = graph.find_by_name("concat").unwrap();
    assert_eq!(graph.element_type(concat), Some(ElementType::U8));
    for fq in graph.nodes_of_type(OpType::FakeQuantize) {
        assert_eq!(graph.element_type(fq), Some(ElementType::U8));
    }

    // (x - [0, 128]) * 0.01 ends up as x * 0.01 + [0, -1.28]
    let add = graph.input_node(network.result, 0).unwrap();
    assert!(graph.is_op(add, OpType::Add));
    assert_eq!(graph.name(add), "concat_Multiply");
    let bias = graph.constant(graph.input_node(add, 1).unwrap()).unwrap();
    assert_eq!(bias.shape(), &[1, 2, 1, 1]);
    let bias = bias.to_vec();
    approx::assert_abs_diff_eq!(bias[0], 0.0, epsilon = 1e-6);
    approx::assert_abs_diff_eq!(bias[1], -1.28, epsilon = 1e-5);

    let after = run(&graph, &feeds(&network));
    assert_all_close(&before, &after, 1e-4);
}

#[test]
fn test_single_scale_when_registered() {
    let params = LayerParams::default();
    let mut registry = TransformationRegistry::all(params.clone());
    registry.remove_branch_specific(OpType::Concat);
    let registry = registry.add_branch_specific(ConcatTransformation::new(params));
    let transformer = LowPrecisionTransformer::with_registry(registry);

    let mut graph = LptGraph::new();
    let network = concat_network(&mut graph);
    let before = run(&graph, &feeds(&network));

    transformer.transform(&mut graph).unwrap();

    let limits = |name: &str| {
        let fq = graph.find_by_name(name).unwrap();
        assert_eq!(graph.element_type(fq), Some(ElementType::I8));
        let low = graph.constant(graph.input_node(fq, 3).unwrap()).unwrap().first().unwrap();
        let high = graph.constant(graph.input_node(fq, 4).unwrap()).unwrap().first().unwrap();
        (low, high)
    };
    assert_eq!(limits("fq1"), (-43.0, 127.0));
    assert_eq!(limits("fq2"), (-128.0, 42.0));

    // One common scale coarsens the narrower branch by up to one step
    let step = (2.55 + 1.28) / 255.0;
    let after = run(&graph, &feeds(&network));
    assert_all_close(&before, &after, step);
}

#[test]
fn test_convolution_consumer_uses_single_scale() {
    let mut graph = LptGraph::new();
    let network = concat_network(&mut graph);
    let convolution = convolution(&mut graph, network.concat);
    graph.add_op(Op::Result).inputs(&[convolution]).finish().unwrap();

    LowPrecisionTransformer::new().transform(&mut graph).unwrap();

    let dequantization = graph.input_node(convolution, 0).unwrap();
    assert_eq!(graph.name(dequantization), "concat_Multiply");
    for fq in graph.nodes_of_type(OpType::FakeQuantize) {
        assert_eq!(graph.element_type(fq), Some(ElementType::I8));
    }
    let concat = graph.find_by_name("concat").unwrap();
    assert_eq!(graph.element_type(concat), Some(ElementType::I8));
}
