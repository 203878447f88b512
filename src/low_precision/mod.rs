//! Low-precision transformation engine
//!
//! Decomposes FakeQuantize operations into quantize + dequantize pairs and
//! moves the dequantization chains as far down the graph as the operations
//! allow, leaving integer compute behind.

pub mod concat;
pub mod concat_multi_channels;
pub mod dequantization;
pub mod fake_quantize_fold;
pub mod layer_transformation;
pub mod network_helper;
pub mod registry;
pub mod subgraph;
pub mod transformations;
pub mod transformer;

pub use concat::{ConcatTransformation, DequantizationCache};
pub use concat_multi_channels::{is_multi_channel, ConcatMultiChannelsTransformation};
pub use dequantization::{DequantizationValues, FakeQuantizeDequantization};
pub use fake_quantize_fold::{fold_fake_quantize, FoldLimits};
pub use layer_transformation::{
    DataPrecision, LayerParams, LayerTransformation, QuantizationDetails, TransformationContext,
};
pub use registry::TransformationRegistry;
pub use subgraph::Subgraph;
pub use transformer::{LowPrecisionTransformer, PhaseStats, TransformationStats};
