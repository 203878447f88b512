//! Low-precision transformer
//!
//! Runs the registered transformations over a graph in six ordered phases.
//! Every phase is one full traversal over a topological snapshot; nodes
//! removed or replaced during the traversal are skipped.

use super::layer_transformation::{LayerParams, LayerTransformation, TransformationContext};
use super::registry::TransformationRegistry;
use crate::config::LowPrecisionConfig;
use crate::error::{LptError, Result};
use crate::graph::{LptGraph, NodeId, OpType};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Kinds that get an output precision override before any rewrite
const TYPE_RELAXED_OPS: [OpType; 9] = [
    OpType::Add,
    OpType::AvgPool,
    OpType::Concat,
    OpType::Convolution,
    OpType::FakeQuantize,
    OpType::GroupConvolution,
    OpType::Interpolate,
    OpType::Multiply,
    OpType::Subtract,
];

/// Low-precision transformer
///
/// Owns the transformation registry and applies it to graphs.
pub struct LowPrecisionTransformer {
    registry: TransformationRegistry,
}

impl LowPrecisionTransformer {
    /// Transformer with the default transformation set and parameters
    pub fn new() -> Self {
        Self::with_params(LayerParams::default())
    }

    /// Default transformation set with custom parameters
    pub fn with_params(params: LayerParams) -> Self {
        Self::with_registry(TransformationRegistry::all(params))
    }

    pub fn with_registry(registry: TransformationRegistry) -> Self {
        Self { registry }
    }

    /// Build from a configuration file
    ///
    /// Disabled transformations are removed from every keyed bucket.
    pub fn from_config(config: &LowPrecisionConfig) -> Result<Self> {
        let params = config.resolve()?;
        let mut registry = TransformationRegistry::all(params);
        for op_type in config.disabled_op_types()? {
            registry.remove(op_type);
        }
        Ok(Self::with_registry(registry))
    }

    pub fn registry(&self) -> &TransformationRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut TransformationRegistry {
        &mut self.registry
    }

    /// Transform the graph
    ///
    /// Fails without touching the graph when no FakeQuantize transformation
    /// is registered. Any other error aborts the run and leaves the graph
    /// partially rewritten.
    pub fn transform(&self, graph: &mut LptGraph) -> Result<TransformationStats> {
        if self.registry.transformations(OpType::FakeQuantize).is_empty() {
            return Err(LptError::MissingFakeQuantizeTransformation);
        }

        let start_time = Instant::now();
        let initial_stats = graph.statistics();
        info!("Starting low-precision transformation...");

        let registry = &self.registry;
        let mut ctx = TransformationContext::new(registry);
        let mut phases = Vec::new();

        phases.push(run_phase("TypeRelaxation", graph, |graph| Ok(mark_type_relaxed(graph)))?);
        phases.push(run_phase("BranchSpecific", graph, |graph| {
            traverse(graph, &mut ctx, |op_type| registry.branch_specific(op_type))
        })?);
        phases.push(run_phase("FakeQuantize", graph, |graph| {
            traverse(graph, &mut ctx, |op_type| match op_type {
                OpType::FakeQuantize => registry.transformations(op_type),
                _ => Vec::new(),
            })
        })?);
        phases.push(run_phase("General", graph, |graph| {
            traverse(graph, &mut ctx, |op_type| registry.transformations(op_type))
        })?);
        phases.push(run_phase("Cleanup", graph, |graph| {
            traverse(graph, &mut ctx, |op_type| registry.cleanup(op_type))
        })?);
        for transformation in registry.standalone_cleanup() {
            let name = format!("StandaloneCleanup({})", transformation.name());
            phases.push(run_phase(&name, graph, |graph| {
                traverse(graph, &mut ctx, |op_type| {
                    if op_type == transformation.matched_op() {
                        vec![transformation]
                    } else {
                        Vec::new()
                    }
                })
            })?);
        }

        let final_stats = graph.statistics();
        let stats = TransformationStats {
            initial_nodes: initial_stats.total_nodes,
            final_nodes: final_stats.total_nodes,
            initial_edges: initial_stats.total_edges,
            final_edges: final_stats.total_edges,
            total_rewrites: phases.iter().map(|p| p.rewrites).sum(),
            duration: start_time.elapsed(),
            phases,
        };

        info!(
            "Low-precision transformation complete: {} rewrites, nodes {} → {} in {:?}",
            stats.total_rewrites, stats.initial_nodes, stats.final_nodes, stats.duration
        );
        Ok(stats)
    }
}

impl Default for LowPrecisionTransformer {
    fn default() -> Self {
        Self::new()
    }
}

fn run_phase(name: &str, graph: &mut LptGraph, phase: impl FnOnce(&mut LptGraph) -> Result<usize>) -> Result<PhaseStats> {
    let phase_start = Instant::now();
    let nodes_before = graph.statistics().total_nodes;

    let rewrites = phase(graph)?;

    let stats = PhaseStats {
        name: name.to_string(),
        rewrites,
        nodes_before,
        nodes_after: graph.statistics().total_nodes,
        duration: phase_start.elapsed(),
    };
    info!(
        "  {} - {} rewrites, nodes {} → {} ({:?})",
        stats.name, stats.rewrites, stats.nodes_before, stats.nodes_after, stats.duration
    );
    Ok(stats)
}

fn mark_type_relaxed(graph: &mut LptGraph) -> usize {
    let mut marked = 0;
    for node in graph.node_ids() {
        let relaxable = graph.op_type(node).map(|t| TYPE_RELAXED_OPS.contains(&t)).unwrap_or(false);
        if relaxable && graph.mark_type_relaxed(node) {
            marked += 1;
        }
    }
    marked
}

/// One traversal; the first transformation that changes a node ends the
/// attempts for that node
fn traverse<'r>(
    graph: &mut LptGraph,
    ctx: &mut TransformationContext<'r>,
    lookup: impl Fn(OpType) -> Vec<&'r dyn LayerTransformation>,
) -> Result<usize> {
    let snapshot: Vec<(NodeId, u64)> = graph
        .topological_sort()?
        .into_iter()
        .filter_map(|node| graph.uid(node).map(|uid| (node, uid)))
        .collect();

    let mut rewrites = 0;
    for (node, uid) in snapshot {
        // Gone, or the index now belongs to a node created by a rewrite
        if graph.uid(node) != Some(uid) {
            continue;
        }
        let Some(op_type) = graph.op_type(node) else {
            continue;
        };

        for transformation in lookup(op_type) {
            let name = graph.name(node).to_string();
            if transformation.transform(ctx, graph, node)? {
                debug!("{} rewrote {}", transformation.name(), name);
                rewrites += 1;
                break;
            }
        }
    }
    Ok(rewrites)
}

/// Statistics for a single phase
#[derive(Debug, Clone)]
pub struct PhaseStats {
    pub name: String,
    pub rewrites: usize,
    pub nodes_before: usize,
    pub nodes_after: usize,
    pub duration: Duration,
}

/// Overall transformation statistics
#[derive(Debug, Clone)]
pub struct TransformationStats {
    pub initial_nodes: usize,
    pub final_nodes: usize,
    pub initial_edges: usize,
    pub final_edges: usize,
    pub total_rewrites: usize,
    pub duration: Duration,
    pub phases: Vec<PhaseStats>,
}

impl TransformationStats {
    pub fn phase(&self, name: &str) -> Option<&PhaseStats> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// Rewrites of a phase, zero for unknown phases
    pub fn rewrites(&self, name: &str) -> usize {
        self.phase(name).map(|p| p.rewrites).unwrap_or(0)
    }
}

impl std::fmt::Display for TransformationStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Low-Precision Transformation Statistics:")?;
        writeln!(f, "  Nodes: {} → {}", self.initial_nodes, self.final_nodes)?;
        writeln!(f, "  Edges: {} → {}", self.initial_edges, self.final_edges)?;
        writeln!(f, "  Total rewrites: {}", self.total_rewrites)?;
        writeln!(f, "  Total time: {:?}", self.duration)?;

        if !self.phases.is_empty() {
            writeln!(f, "  Phase details:")?;
            for phase in &self.phases {
                writeln!(
                    f,
                    "    {} - {} rewrites, nodes {} → {} ({:?})",
                    phase.name, phase.rewrites, phase.nodes_before, phase.nodes_after, phase.duration
                )?;
            }
        }

        Ok(())
    }
}
