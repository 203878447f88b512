// Low-precision graph IR
//
// Arena graph built on petgraph's StableGraph. Node handles stay valid across
// removals, and every data edge records the producer output slot and the
// consumer input slot. Nodes carry their inferred output type and shape plus an
// explicit precision override used by the low-precision passes.

use super::fold::broadcast_shape;
use super::tensor::{ElementType, Tensor};
use anyhow::{anyhow, bail, Result};
use petgraph::algo::toposort;
use petgraph::stable_graph::{EdgeReference, NodeIndex, StableGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Node identifier in the graph (petgraph NodeIndex)
pub type NodeId = NodeIndex;

/// Producer output reference: (node, output slot)
pub type Output = (NodeId, u8);

/// Data dependency: tensor flows from source to destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    /// Which output slot on the source node
    pub output_slot: u8,
    /// Which input slot on the destination node
    pub input_slot: u8,
}

/// Operation with its attributes
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Parameter,
    Constant(Tensor),
    Result,
    Convert { destination: ElementType },
    Add,
    Subtract,
    Multiply,
    Divide,
    /// Inputs: data, input low, input high, output low, output high
    FakeQuantize { levels: usize },
    Concat { axis: usize },
    Convolution,
    GroupConvolution,
    MatMul,
    MaxPool { kernel: [usize; 2] },
    AvgPool { kernel: [usize; 2] },
    /// Nearest-neighbour upsampling of the two trailing dimensions
    Interpolate { scale: usize },
    Relu,
    Reshape { shape: Vec<usize> },
    Squeeze { axes: Vec<usize> },
    Unsqueeze { axes: Vec<usize> },
    Transpose { order: Vec<usize> },
}

impl Op {
    pub fn op_type(&self) -> OpType {
        match self {
            Op::Parameter => OpType::Parameter,
            Op::Constant(_) => OpType::Constant,
            Op::Result => OpType::Result,
            Op::Convert { .. } => OpType::Convert,
            Op::Add => OpType::Add,
            Op::Subtract => OpType::Subtract,
            Op::Multiply => OpType::Multiply,
            Op::Divide => OpType::Divide,
            Op::FakeQuantize { .. } => OpType::FakeQuantize,
            Op::Concat { .. } => OpType::Concat,
            Op::Convolution => OpType::Convolution,
            Op::GroupConvolution => OpType::GroupConvolution,
            Op::MatMul => OpType::MatMul,
            Op::MaxPool { .. } => OpType::MaxPool,
            Op::AvgPool { .. } => OpType::AvgPool,
            Op::Interpolate { .. } => OpType::Interpolate,
            Op::Relu => OpType::Relu,
            Op::Reshape { .. } => OpType::Reshape,
            Op::Squeeze { .. } => OpType::Squeeze,
            Op::Unsqueeze { .. } => OpType::Unsqueeze,
            Op::Transpose { .. } => OpType::Transpose,
        }
    }
}

/// Operation kind without attributes
///
/// Used as the transformation registry key. Ordering is alphabetical by
/// operation name so registry iteration is deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    Add,
    AvgPool,
    Concat,
    Constant,
    Convert,
    Convolution,
    Divide,
    FakeQuantize,
    GroupConvolution,
    Interpolate,
    MatMul,
    MaxPool,
    Multiply,
    Parameter,
    Relu,
    Reshape,
    Result,
    Squeeze,
    Subtract,
    Transpose,
    Unsqueeze,
}

impl OpType {
    pub const ALL: [OpType; 21] = [
        OpType::Add,
        OpType::AvgPool,
        OpType::Concat,
        OpType::Constant,
        OpType::Convert,
        OpType::Convolution,
        OpType::Divide,
        OpType::FakeQuantize,
        OpType::GroupConvolution,
        OpType::Interpolate,
        OpType::MatMul,
        OpType::MaxPool,
        OpType::Multiply,
        OpType::Parameter,
        OpType::Relu,
        OpType::Reshape,
        OpType::Result,
        OpType::Squeeze,
        OpType::Subtract,
        OpType::Transpose,
        OpType::Unsqueeze,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            OpType::Add => "Add",
            OpType::AvgPool => "AvgPool",
            OpType::Concat => "Concat",
            OpType::Constant => "Constant",
            OpType::Convert => "Convert",
            OpType::Convolution => "Convolution",
            OpType::Divide => "Divide",
            OpType::FakeQuantize => "FakeQuantize",
            OpType::GroupConvolution => "GroupConvolution",
            OpType::Interpolate => "Interpolate",
            OpType::MatMul => "MatMul",
            OpType::MaxPool => "MaxPool",
            OpType::Multiply => "Multiply",
            OpType::Parameter => "Parameter",
            OpType::Relu => "Relu",
            OpType::Reshape => "Reshape",
            OpType::Result => "Result",
            OpType::Squeeze => "Squeeze",
            OpType::Subtract => "Subtract",
            OpType::Transpose => "Transpose",
            OpType::Unsqueeze => "Unsqueeze",
        }
    }
}

impl Ord for OpType {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name().cmp(other.name())
    }
}

impl PartialOrd for OpType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OpType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        OpType::ALL
            .iter()
            .copied()
            .find(|t| t.name() == s)
            .ok_or_else(|| anyhow!("Unknown operation type: {}", s))
    }
}

/// A node in the computation graph
#[derive(Debug, Clone)]
pub struct GraphNode {
    /// Friendly name
    pub name: String,
    /// Operation and attributes
    pub op: Op,
    /// Inferred output element type
    pub output_type: ElementType,
    /// Inferred output shape
    pub shape: Vec<usize>,
    /// Node accepts an output precision override
    pub type_relaxed: bool,
    /// Overridden output precision, only honoured when `type_relaxed`
    pub precision_override: Option<ElementType>,
    uid: u64,
}

impl GraphNode {
    pub fn op_type(&self) -> OpType {
        self.op.op_type()
    }

    /// Effective output element type
    pub fn element_type(&self) -> ElementType {
        match self.precision_override {
            Some(precision) if self.type_relaxed => precision,
            _ => self.output_type,
        }
    }

    /// Identity that is never reused, unlike petgraph indices
    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn constant(&self) -> Option<&Tensor> {
        match &self.op {
            Op::Constant(tensor) => Some(tensor),
            _ => None,
        }
    }
}

/// Low-precision computation graph using petgraph
pub struct LptGraph {
    /// The underlying petgraph structure
    graph: StableGraph<GraphNode, Dependency>,
    next_uid: u64,
}

impl LptGraph {
    /// Create a new empty graph
    pub fn new() -> Self {
        Self {
            graph: StableGraph::new(),
            next_uid: 0,
        }
    }

    /// Start building a new operation
    pub fn add_op(&mut self, op: Op) -> NewOp<'_> {
        NewOp::new(self, op)
    }

    /// Get node by ID
    pub fn node(&self, node_id: NodeId) -> Option<&GraphNode> {
        self.graph.node_weight(node_id)
    }

    /// Get mutable node by ID
    pub fn node_mut(&mut self, node_id: NodeId) -> Option<&mut GraphNode> {
        self.graph.node_weight_mut(node_id)
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.graph.contains_node(node_id)
    }

    pub fn op_type(&self, node_id: NodeId) -> Option<OpType> {
        self.node(node_id).map(GraphNode::op_type)
    }

    pub fn is_op(&self, node_id: NodeId, op_type: OpType) -> bool {
        self.op_type(node_id) == Some(op_type)
    }

    /// Friendly name, or an empty string for removed nodes
    pub fn name(&self, node_id: NodeId) -> &str {
        self.node(node_id).map(|n| n.name.as_str()).unwrap_or("")
    }

    pub fn element_type(&self, node_id: NodeId) -> Option<ElementType> {
        self.node(node_id).map(GraphNode::element_type)
    }

    pub fn shape(&self, node_id: NodeId) -> Option<&[usize]> {
        self.node(node_id).map(|n| n.shape.as_slice())
    }

    pub fn uid(&self, node_id: NodeId) -> Option<u64> {
        self.node(node_id).map(GraphNode::uid)
    }

    /// Constant value, if the node is a Constant
    pub fn constant(&self, node_id: NodeId) -> Option<&Tensor> {
        self.node(node_id).and_then(GraphNode::constant)
    }

    pub fn is_constant(&self, node_id: NodeId) -> bool {
        self.constant(node_id).is_some()
    }

    /// Input sources ordered by input slot
    pub fn inputs(&self, node_id: NodeId) -> Vec<Output> {
        let mut edges: Vec<_> = self
            .graph
            .edges_directed(node_id, Direction::Incoming)
            .map(|edge: EdgeReference<Dependency>| (edge.weight().input_slot, edge.source(), edge.weight().output_slot))
            .collect();
        edges.sort_by_key(|&(slot, _, _)| slot);
        edges.into_iter().map(|(_, source, output_slot)| (source, output_slot)).collect()
    }

    pub fn input_count(&self, node_id: NodeId) -> usize {
        self.graph.edges_directed(node_id, Direction::Incoming).count()
    }

    /// Source feeding `input_slot`
    pub fn input(&self, node_id: NodeId, input_slot: usize) -> Option<Output> {
        self.graph
            .edges_directed(node_id, Direction::Incoming)
            .find(|edge| usize::from(edge.weight().input_slot) == input_slot)
            .map(|edge| (edge.source(), edge.weight().output_slot))
    }

    pub fn input_node(&self, node_id: NodeId, input_slot: usize) -> Option<NodeId> {
        self.input(node_id, input_slot).map(|(source, _)| source)
    }

    /// Consumers as (consumer, input slot), in deterministic order
    pub fn consumers(&self, node_id: NodeId) -> Vec<(NodeId, u8)> {
        let mut consumers: Vec<_> = self
            .graph
            .edges_directed(node_id, Direction::Outgoing)
            .map(|edge| (edge.target(), edge.weight().input_slot))
            .collect();
        consumers.sort_by_key(|&(target, slot)| (target.index(), slot));
        consumers
    }

    /// Distinct consumer nodes
    pub fn consumer_nodes(&self, node_id: NodeId) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.consumers(node_id).into_iter().map(|(target, _)| target).collect();
        nodes.dedup();
        nodes
    }

    /// Number of consuming inputs
    pub fn consumer_count(&self, node_id: NodeId) -> usize {
        self.graph.edges_directed(node_id, Direction::Outgoing).count()
    }

    /// Reconnect one input of `consumer` to a new source
    pub fn set_input(&mut self, consumer: NodeId, input_slot: u8, source: Output) -> Result<()> {
        if !self.contains(source.0) {
            bail!("Source node {:?} does not exist", source.0);
        }
        let edge = self
            .graph
            .edges_directed(consumer, Direction::Incoming)
            .find(|edge| edge.weight().input_slot == input_slot)
            .map(|edge| edge.id())
            .ok_or_else(|| anyhow!("{} has no input {}", self.name(consumer), input_slot))?;
        self.graph.remove_edge(edge);
        self.graph.add_edge(
            source.0,
            consumer,
            Dependency {
                output_slot: source.1,
                input_slot,
            },
        );
        Ok(())
    }

    /// Copy a node (name, attributes, precision override) onto new inputs
    pub fn clone_with_new_inputs(&mut self, node_id: NodeId, inputs: &[Output]) -> Result<NodeId> {
        let node = self
            .node(node_id)
            .cloned()
            .ok_or_else(|| anyhow!("Node {:?} does not exist", node_id))?;

        let mut builder = self.add_op(node.op).name(node.name);
        for (slot, &(source, output_slot)) in inputs.iter().enumerate() {
            builder = builder.input(source, output_slot, slot as u8);
        }
        if node.type_relaxed {
            builder = builder.relaxed();
        }
        if let Some(precision) = node.precision_override {
            builder = builder.precision(precision);
        }
        builder.finish()
    }

    /// Rewire every consumer of `old` to `new`, then prune `old` and any
    /// producers left without consumers
    pub fn replace_node(&mut self, old: NodeId, new: NodeId) -> Result<()> {
        if old == new {
            return Ok(());
        }
        if !self.contains(old) || !self.contains(new) {
            bail!("Cannot replace {:?} with {:?}: node does not exist", old, new);
        }

        let edges: Vec<_> = self
            .graph
            .edges_directed(old, Direction::Outgoing)
            .filter(|edge| edge.target() != new)
            .map(|edge| (edge.id(), edge.target(), *edge.weight()))
            .collect();

        for (edge, target, dependency) in edges {
            self.graph.remove_edge(edge);
            self.graph.add_edge(new, target, dependency);
        }

        self.prune(old);
        Ok(())
    }

    /// Remove `node_id` if it has no consumers, cascading to its producers
    ///
    /// Parameters and Results are never pruned. Returns the number of removed nodes.
    pub fn prune(&mut self, node_id: NodeId) -> usize {
        let mut removed = 0;
        let mut stack = vec![node_id];

        while let Some(current) = stack.pop() {
            let prunable = match self.node(current) {
                Some(node) => !matches!(node.op, Op::Parameter | Op::Result),
                None => false,
            };
            if !prunable || self.consumer_count(current) > 0 {
                continue;
            }

            let producers: Vec<NodeId> = self.graph.neighbors_directed(current, Direction::Incoming).collect();
            self.graph.remove_node(current);
            removed += 1;
            stack.extend(producers);
        }

        removed
    }

    /// Remove a node that has no consumers
    pub fn remove_node(&mut self, node_id: NodeId) -> Result<()> {
        if !self.contains(node_id) {
            bail!("Node {:?} does not exist", node_id);
        }
        if self.consumer_count(node_id) > 0 {
            bail!("Cannot remove {}: node still has consumers", self.name(node_id));
        }
        self.graph.remove_node(node_id);
        Ok(())
    }

    /// Give a node output precision override capability
    ///
    /// Returns `true` when the node was not relaxed before.
    pub fn mark_type_relaxed(&mut self, node_id: NodeId) -> bool {
        match self.node_mut(node_id) {
            Some(node) if !node.type_relaxed => {
                node.type_relaxed = true;
                true
            }
            _ => false,
        }
    }

    pub fn is_type_relaxed(&self, node_id: NodeId) -> bool {
        self.node(node_id).map(|n| n.type_relaxed).unwrap_or(false)
    }

    /// Set the output element type: through the override when the node is
    /// relaxed, directly otherwise
    pub fn set_output_precision(&mut self, node_id: NodeId, precision: ElementType) -> Result<()> {
        let node = self
            .node_mut(node_id)
            .ok_or_else(|| anyhow!("Node {:?} does not exist", node_id))?;
        if node.type_relaxed {
            node.precision_override = Some(precision);
        } else {
            node.output_type = precision;
        }
        Ok(())
    }

    /// Override the output element type of a relaxed node
    pub fn override_output_type(&mut self, node_id: NodeId, precision: ElementType) -> Result<()> {
        let node = self
            .node_mut(node_id)
            .ok_or_else(|| anyhow!("Node {:?} does not exist", node_id))?;
        if !node.type_relaxed {
            bail!("{} does not support precision override", node.name);
        }
        node.precision_override = Some(precision);
        Ok(())
    }

    /// Compute topological sort
    pub fn topological_sort(&self) -> Result<Vec<NodeId>> {
        toposort(&self.graph, None).map_err(|_| anyhow!("Graph contains cycles"))
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.graph.node_indices().collect()
    }

    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        self.graph.node_indices().find(|&id| self.graph[id].name == name)
    }

    /// Nodes of one operation type, in index order
    pub fn nodes_of_type(&self, op_type: OpType) -> Vec<NodeId> {
        self.graph
            .node_indices()
            .filter(|&id| self.graph[id].op_type() == op_type)
            .collect()
    }

    pub fn parameters(&self) -> Vec<NodeId> {
        self.nodes_of_type(OpType::Parameter)
    }

    pub fn results(&self) -> Vec<NodeId> {
        self.nodes_of_type(OpType::Result)
    }

    /// Get graph statistics
    pub fn statistics(&self) -> GraphStatistics {
        let mut op_type_counts: FxHashMap<OpType, usize> = FxHashMap::default();
        for node in self.graph.node_weights() {
            *op_type_counts.entry(node.op_type()).or_insert(0) += 1;
        }

        GraphStatistics {
            total_nodes: self.graph.node_count(),
            total_edges: self.graph.edge_count(),
            num_parameters: op_type_counts.get(&OpType::Parameter).copied().unwrap_or(0),
            num_results: op_type_counts.get(&OpType::Result).copied().unwrap_or(0),
            num_constants: op_type_counts.get(&OpType::Constant).copied().unwrap_or(0),
            op_type_counts,
        }
    }

    /// Access the underlying petgraph
    pub fn petgraph(&self) -> &StableGraph<GraphNode, Dependency> {
        &self.graph
    }

    fn allocate_uid(&mut self) -> u64 {
        let uid = self.next_uid;
        self.next_uid += 1;
        uid
    }

    /// Local type and shape inference for a new node
    fn infer_output(&self, op: &Op, inputs: &[Output]) -> Result<(ElementType, Vec<usize>)> {
        let input_type = |i: usize| -> Result<ElementType> {
            inputs
                .get(i)
                .and_then(|&(source, _)| self.element_type(source))
                .ok_or_else(|| anyhow!("{} expects input {}", op.op_type(), i))
        };
        let input_shape = |i: usize| -> Result<Vec<usize>> {
            inputs
                .get(i)
                .and_then(|&(source, _)| self.shape(source))
                .map(<[usize]>::to_vec)
                .ok_or_else(|| anyhow!("{} expects input {}", op.op_type(), i))
        };

        match op {
            Op::Parameter => bail!("Parameter requires an explicit output type and shape"),
            Op::Constant(tensor) => Ok((tensor.element_type(), tensor.shape().to_vec())),
            Op::Result | Op::Relu => Ok((input_type(0)?, input_shape(0)?)),
            Op::Convert { destination } => Ok((*destination, input_shape(0)?)),
            Op::Add | Op::Subtract | Op::Multiply | Op::Divide => {
                let (a, b) = (input_shape(0)?, input_shape(1)?);
                let shape = broadcast_shape(&a, &b)
                    .ok_or_else(|| anyhow!("{}: shapes {:?} and {:?} are not broadcastable", op.op_type(), a, b))?;
                Ok((input_type(0)?, shape))
            }
            Op::FakeQuantize { .. } => {
                if inputs.len() != 5 {
                    bail!("FakeQuantize expects 5 inputs, got {}", inputs.len());
                }
                Ok((input_type(0)?, input_shape(0)?))
            }
            Op::Concat { axis } => {
                let mut shape = input_shape(0)?;
                if *axis >= shape.len() {
                    bail!("Concat axis {} is out of range for rank {}", axis, shape.len());
                }
                for i in 1..inputs.len() {
                    let other = input_shape(i)?;
                    let compatible = other.len() == shape.len()
                        && other.iter().zip(&shape).enumerate().all(|(d, (x, y))| d == *axis || x == y);
                    if !compatible {
                        bail!("Concat input shapes {:?} and {:?} are incompatible", shape, other);
                    }
                    shape[*axis] += other[*axis];
                }
                Ok((input_type(0)?, shape))
            }
            Op::Convolution | Op::GroupConvolution => {
                let (data, weights) = (input_shape(0)?, input_shape(1)?);
                if data.len() < 3 || weights.is_empty() {
                    bail!("{} expects NC... data and weights", op.op_type());
                }
                let out_channels = match op {
                    Op::GroupConvolution if weights.len() > 1 => weights[0] * weights[1],
                    _ => weights[0],
                };
                let mut shape = data;
                shape[1] = out_channels;
                Ok((input_type(0)?, shape))
            }
            Op::MatMul => {
                let (a, b) = (input_shape(0)?, input_shape(1)?);
                if a.len() < 2 || b.len() < 2 || a[a.len() - 1] != b[b.len() - 2] {
                    bail!("MatMul shapes {:?} and {:?} are incompatible", a, b);
                }
                let mut shape = a[..a.len() - 1].to_vec();
                shape.push(b[b.len() - 1]);
                Ok((input_type(0)?, shape))
            }
            Op::MaxPool { kernel } | Op::AvgPool { kernel } => {
                let mut shape = input_shape(0)?;
                if shape.len() != 4 || kernel[0] == 0 || kernel[1] == 0 {
                    bail!("{} expects NCHW input and a non-empty kernel", op.op_type());
                }
                shape[2] /= kernel[0];
                shape[3] /= kernel[1];
                Ok((input_type(0)?, shape))
            }
            Op::Interpolate { scale } => {
                let mut shape = input_shape(0)?;
                if shape.len() < 3 {
                    bail!("Interpolate expects at least rank 3 input");
                }
                let rank = shape.len();
                shape[rank - 2] *= scale;
                shape[rank - 1] *= scale;
                Ok((input_type(0)?, shape))
            }
            Op::Reshape { shape } => {
                let input = input_shape(0)?;
                if input.iter().product::<usize>() != shape.iter().product::<usize>() {
                    bail!("Cannot reshape {:?} to {:?}", input, shape);
                }
                Ok((input_type(0)?, shape.clone()))
            }
            Op::Squeeze { axes } => {
                let input = input_shape(0)?;
                if axes.iter().any(|&axis| input.get(axis) != Some(&1)) {
                    bail!("Cannot squeeze axes {:?} of {:?}", axes, input);
                }
                let shape = input
                    .iter()
                    .enumerate()
                    .filter(|(d, _)| !axes.contains(d))
                    .map(|(_, &dim)| dim)
                    .collect();
                Ok((input_type(0)?, shape))
            }
            Op::Unsqueeze { axes } => {
                let mut shape = input_shape(0)?;
                let mut sorted = axes.clone();
                sorted.sort_unstable();
                for axis in sorted {
                    if axis > shape.len() {
                        bail!("Unsqueeze axis {} is out of range", axis);
                    }
                    shape.insert(axis, 1);
                }
                Ok((input_type(0)?, shape))
            }
            Op::Transpose { order } => {
                let input = input_shape(0)?;
                let mut seen = vec![false; input.len()];
                for &axis in order {
                    match seen.get_mut(axis) {
                        Some(flag) if !*flag => *flag = true,
                        _ => bail!("Invalid transpose order {:?} for rank {}", order, input.len()),
                    }
                }
                if order.len() != input.len() {
                    bail!("Invalid transpose order {:?} for rank {}", order, input.len());
                }
                Ok((input_type(0)?, order.iter().map(|&axis| input[axis]).collect()))
            }
        }
    }
}

impl Default for LptGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for adding operations to the graph
pub struct NewOp<'a> {
    graph: &'a mut LptGraph,
    name: String,
    op: Op,
    inputs: Vec<(NodeId, u8, u8)>, // (source_id, output_slot, input_slot)
    output: Option<(ElementType, Vec<usize>)>,
    type_relaxed: bool,
    precision_override: Option<ElementType>,
}

impl<'a> NewOp<'a> {
    fn new(graph: &'a mut LptGraph, op: Op) -> Self {
        Self {
            graph,
            name: String::new(),
            op,
            inputs: Vec::new(),
            output: None,
            type_relaxed: false,
            precision_override: None,
        }
    }

    /// Set node name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add an input connection
    pub fn input(mut self, source_id: NodeId, output_slot: u8, input_slot: u8) -> Self {
        self.inputs.push((source_id, output_slot, input_slot));
        self
    }

    /// Append inputs from output slot 0 of each source
    pub fn inputs(mut self, sources: &[NodeId]) -> Self {
        for &source in sources {
            let slot = self.inputs.len() as u8;
            self.inputs.push((source, 0, slot));
        }
        self
    }

    /// Explicit output type and shape, bypassing inference
    pub fn output(mut self, element_type: ElementType, shape: Vec<usize>) -> Self {
        self.output = Some((element_type, shape));
        self
    }

    /// Enable output precision override
    pub fn relaxed(mut self) -> Self {
        self.type_relaxed = true;
        self
    }

    /// Relaxed node with its output precision overridden
    pub fn precision(mut self, precision: ElementType) -> Self {
        self.type_relaxed = true;
        self.precision_override = Some(precision);
        self
    }

    /// Finish building and add to graph
    pub fn finish(self) -> Result<NodeId> {
        let NewOp {
            graph,
            name,
            op,
            mut inputs,
            output,
            type_relaxed,
            precision_override,
        } = self;

        inputs.sort_by_key(|&(_, _, input_slot)| input_slot);
        if let Some(&(missing, _, _)) = inputs.iter().find(|(source, _, _)| !graph.contains(*source)) {
            bail!("Input node {:?} does not exist", missing);
        }

        let sources: Vec<Output> = inputs.iter().map(|&(source, slot, _)| (source, slot)).collect();
        let (output_type, shape) = match output {
            Some(explicit) => explicit,
            None => graph.infer_output(&op, &sources)?,
        };

        let uid = graph.allocate_uid();
        let name = if name.is_empty() {
            format!("{}_{}", op.op_type(), uid)
        } else {
            name
        };

        let node_id = graph.graph.add_node(GraphNode {
            name,
            op,
            output_type,
            shape,
            type_relaxed,
            precision_override,
            uid,
        });

        for (source_id, output_slot, input_slot) in inputs {
            graph.graph.add_edge(
                source_id,
                node_id,
                Dependency {
                    output_slot,
                    input_slot,
                },
            );
        }

        Ok(node_id)
    }
}

/// Graph statistics
#[derive(Debug, Clone)]
pub struct GraphStatistics {
    pub total_nodes: usize,
    pub total_edges: usize,
    pub num_parameters: usize,
    pub num_results: usize,
    pub num_constants: usize,
    pub op_type_counts: FxHashMap<OpType, usize>,
}

impl GraphStatistics {
    pub fn count(&self, op_type: OpType) -> usize {
        self.op_type_counts.get(&op_type).copied().unwrap_or(0)
    }
}

impl fmt::Display for GraphStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Graph Statistics:")?;
        writeln!(f, "  Total nodes: {}", self.total_nodes)?;
        writeln!(f, "  Total edges: {}", self.total_edges)?;
        writeln!(f, "  Parameters: {}", self.num_parameters)?;
        writeln!(f, "  Results: {}", self.num_results)?;
        writeln!(f, "  Constants: {}", self.num_constants)?;
        writeln!(f, "  Operation types:")?;

        let mut sorted_ops: Vec<_> = self.op_type_counts.iter().collect();
        sorted_ops.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));

        for (op_type, count) in sorted_ops {
            writeln!(f, "    {}: {}", op_type, count)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parameter(graph: &mut LptGraph, name: &str, shape: Vec<usize>) -> NodeId {
        graph
            .add_op(Op::Parameter)
            .name(name)
            .output(ElementType::F32, shape)
            .finish()
            .unwrap()
    }

    fn scalar(graph: &mut LptGraph, value: f32) -> NodeId {
        graph
            .add_op(Op::Constant(Tensor::scalar(ElementType::F32, value)))
            .finish()
            .unwrap()
    }

    #[test]
    fn test_empty_graph() {
        let graph = LptGraph::new();
        assert_eq!(graph.statistics().total_nodes, 0);
        assert_eq!(graph.statistics().total_edges, 0);
    }

    #[test]
    fn test_builder_pattern() {
        let mut graph = LptGraph::new();

        let input = parameter(&mut graph, "input", vec![1, 3, 4, 4]);
        let two = scalar(&mut graph, 2.0);
        let mul = graph.add_op(Op::Multiply).name("mul").inputs(&[input, two]).finish().unwrap();

        assert_eq!(graph.statistics().total_nodes, 3);
        assert_eq!(graph.statistics().total_edges, 2);
        assert_eq!(graph.shape(mul), Some(&[1, 3, 4, 4][..]));
        assert_eq!(graph.element_type(mul), Some(ElementType::F32));
        assert_eq!(graph.inputs(mul), vec![(input, 0), (two, 0)]);
    }

    #[test]
    fn test_shape_inference() {
        let mut graph = LptGraph::new();
        let a = parameter(&mut graph, "a", vec![1, 2, 4, 4]);
        let b = parameter(&mut graph, "b", vec![1, 3, 4, 4]);

        let concat = graph.add_op(Op::Concat { axis: 1 }).inputs(&[a, b]).finish().unwrap();
        assert_eq!(graph.shape(concat), Some(&[1, 5, 4, 4][..]));

        let pool = graph
            .add_op(Op::MaxPool { kernel: [2, 2] })
            .inputs(&[concat])
            .finish()
            .unwrap();
        assert_eq!(graph.shape(pool), Some(&[1, 5, 2, 2][..]));

        let reshape = graph
            .add_op(Op::Reshape { shape: vec![1, 20] })
            .inputs(&[pool])
            .finish()
            .unwrap();
        assert_eq!(graph.shape(reshape), Some(&[1, 20][..]));

        let convert = graph
            .add_op(Op::Convert {
                destination: ElementType::U8,
            })
            .inputs(&[reshape])
            .finish()
            .unwrap();
        assert_eq!(graph.element_type(convert), Some(ElementType::U8));

        let bad = graph.add_op(Op::Concat { axis: 1 }).inputs(&[a, reshape]).finish();
        assert!(bad.is_err());
    }

    #[test]
    fn test_replace_node_prunes_dead_producers() {
        let mut graph = LptGraph::new();
        let input = parameter(&mut graph, "input", vec![4]);
        let two = scalar(&mut graph, 2.0);
        let mul = graph.add_op(Op::Multiply).name("mul").inputs(&[input, two]).finish().unwrap();
        let relu = graph.add_op(Op::Relu).name("relu").inputs(&[mul]).finish().unwrap();
        let result = graph.add_op(Op::Result).inputs(&[relu]).finish().unwrap();

        // Bypass the multiply entirely
        let new_relu = graph.clone_with_new_inputs(relu, &[(input, 0)]).unwrap();
        graph.replace_node(relu, new_relu).unwrap();

        assert!(!graph.contains(relu));
        assert!(!graph.contains(mul));
        assert!(!graph.contains(two));
        assert!(graph.contains(input));
        assert_eq!(graph.input_node(result, 0), Some(new_relu));
        assert_eq!(graph.name(new_relu), "relu");
    }

    #[test]
    fn test_replace_node_skips_self_edge() {
        let mut graph = LptGraph::new();
        let input = parameter(&mut graph, "input", vec![4]);
        let relu = graph.add_op(Op::Relu).inputs(&[input]).finish().unwrap();
        let result = graph.add_op(Op::Result).inputs(&[relu]).finish().unwrap();
        let two = scalar(&mut graph, 2.0);
        let mul = graph.add_op(Op::Multiply).inputs(&[relu, two]).finish().unwrap();

        graph.replace_node(relu, mul).unwrap();

        assert!(graph.contains(relu));
        assert_eq!(graph.input_node(result, 0), Some(mul));
        assert_eq!(graph.input_node(mul, 0), Some(relu));
    }

    #[test]
    fn test_precision_override() {
        let mut graph = LptGraph::new();
        let input = parameter(&mut graph, "input", vec![4]);
        let relu = graph.add_op(Op::Relu).inputs(&[input]).finish().unwrap();

        assert!(graph.override_output_type(relu, ElementType::U8).is_err());
        graph.set_output_precision(relu, ElementType::U8).unwrap();
        assert_eq!(graph.element_type(relu), Some(ElementType::U8));

        let mul = {
            let one = scalar(&mut graph, 1.0);
            graph.add_op(Op::Multiply).inputs(&[input, one]).finish().unwrap()
        };
        assert!(graph.mark_type_relaxed(mul));
        assert!(!graph.mark_type_relaxed(mul));
        graph.override_output_type(mul, ElementType::I8).unwrap();
        assert_eq!(graph.element_type(mul), Some(ElementType::I8));
        assert_eq!(graph.node(mul).unwrap().output_type, ElementType::F32);
    }

    #[test]
    fn test_uid_is_not_reused() {
        let mut graph = LptGraph::new();
        let a = parameter(&mut graph, "a", vec![1]);
        let relu = graph.add_op(Op::Relu).inputs(&[a]).finish().unwrap();
        let uid = graph.uid(relu).unwrap();
        graph.remove_node(relu).unwrap();

        let again = graph.add_op(Op::Relu).inputs(&[a]).finish().unwrap();
        assert_ne!(graph.uid(again), Some(uid));
    }

    #[test]
    fn test_op_type_order_is_alphabetical() {
        let mut sorted = OpType::ALL.to_vec();
        sorted.sort();
        let names: Vec<_> = sorted.iter().map(|t| t.name()).collect();
        let mut expected = names.clone();
        expected.sort_unstable();
        assert_eq!(names, expected);
        assert_eq!("MatMul".parse::<OpType>().unwrap(), OpType::MatMul);
        assert!("Softmax".parse::<OpType>().is_err());
    }
}
