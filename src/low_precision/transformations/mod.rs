// Per-operation low-precision transformations
//
// Each transformation is triggered by one operation kind and either moves a
// dequantization chain through the operation, decomposes a FakeQuantize, or
// simplifies the chains left behind.

mod add;
mod fake_quantize;
mod fuse_convert;
mod fuse_fake_quantize;
mod fuse_into_fake_quantize;
mod layout;
mod mat_mul;
mod multiply;
mod pooling;
mod relu;
mod subtract_multiply_to_multiply_add;

pub use add::AddTransformation;
pub use fake_quantize::FakeQuantizeTransformation;
pub use fuse_convert::FuseConvertTransformation;
pub use fuse_fake_quantize::FuseFakeQuantizeTransformation;
pub use fuse_into_fake_quantize::{FuseMultiplyToFakeQuantizeTransformation, FuseSubtractToFakeQuantizeTransformation};
pub use layout::LayoutTransformation;
pub use mat_mul::MatMulTransformation;
pub use multiply::MultiplyTransformation;
pub use pooling::{AvgPoolTransformation, MaxPoolTransformation};
pub use relu::ReluTransformation;
pub use subtract_multiply_to_multiply_add::SubtractMultiplyToMultiplyAddTransformation;
