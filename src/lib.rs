//! Hologram low-precision transformations
//!
//! Rewrites a floating-point inference graph that carries FakeQuantize
//! operations into an equivalent low-precision graph: integer compute
//! followed by explicit Convert → Subtract → Multiply dequantization chains.
//!
//! # Architecture
//!
//! ```text
//! LowPrecisionTransformer
//!   ├─ 1. type relaxation (per-node precision override)
//!   ├─ 2. branch-specific   (ConcatMultiChannels)
//!   ├─ 3. FakeQuantize      (decomposition into quantize + dequantize)
//!   ├─ 4. general           (move dequantization through operations)
//!   ├─ 5. cleanup           (fusions inside a traversal)
//!   └─ 6. standalone cleanup (one traversal each)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use hologram_lpt::graph::{ElementType, LptGraph, Op, Tensor};
//! use hologram_lpt::low_precision::LowPrecisionTransformer;
//!
//! # fn main() -> hologram_lpt::Result<()> {
//! let mut graph = LptGraph::new();
//! let input = graph.add_op(Op::Parameter).name("input").output(ElementType::F32, vec![1, 3]).finish()?;
//! let low = graph.add_op(Op::Constant(Tensor::scalar(ElementType::F32, 0.0))).finish()?;
//! let high = graph.add_op(Op::Constant(Tensor::scalar(ElementType::F32, 2.55))).finish()?;
//! let fq = graph
//!     .add_op(Op::FakeQuantize { levels: 256 })
//!     .name("fq")
//!     .inputs(&[input, low, high, low, high])
//!     .finish()?;
//! graph.add_op(Op::Result).input(fq, 0, 0).finish()?;
//!
//! let stats = LowPrecisionTransformer::new().transform(&mut graph)?;
//! println!("{}", stats);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod low_precision;

pub use error::{LptError, Result};
