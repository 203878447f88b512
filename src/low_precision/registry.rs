//! Transformation registry
//!
//! Four buckets keyed by operation kind: branch-specific, general, cleanup
//! and standalone cleanup. Keyed buckets iterate in `OpType` order, which is
//! alphabetical by operation name.

use super::concat_multi_channels::ConcatMultiChannelsTransformation;
use super::layer_transformation::{LayerParams, LayerTransformation};
use super::transformations::{
    AddTransformation, AvgPoolTransformation, FakeQuantizeTransformation, FuseConvertTransformation,
    FuseFakeQuantizeTransformation, FuseMultiplyToFakeQuantizeTransformation,
    FuseSubtractToFakeQuantizeTransformation, LayoutTransformation, MatMulTransformation, MaxPoolTransformation,
    MultiplyTransformation, ReluTransformation, SubtractMultiplyToMultiplyAddTransformation,
};
use crate::graph::OpType;
use std::collections::BTreeMap;

type Bucket = BTreeMap<OpType, Vec<Box<dyn LayerTransformation>>>;

/// Registered transformations for every phase
#[derive(Default)]
pub struct TransformationRegistry {
    branch_specific: Bucket,
    transformations: Bucket,
    cleanup: Bucket,
    standalone_cleanup: Vec<Box<dyn LayerTransformation>>,
}

impl TransformationRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Default transformation set
    pub fn all(params: LayerParams) -> Self {
        Self::new()
            .add_branch_specific(ConcatMultiChannelsTransformation::new(params.clone()))
            .add(AddTransformation::new(params.clone()))
            .add(AvgPoolTransformation::new(params.clone()))
            .add(FakeQuantizeTransformation::new(params.clone()))
            .add(MatMulTransformation::new(params.clone()))
            .add(MaxPoolTransformation::new(params.clone()))
            .add(MultiplyTransformation::new(params.clone()))
            .add(ReluTransformation::new(params.clone()))
            .add(LayoutTransformation::new(OpType::Reshape, params.clone()))
            .add(LayoutTransformation::new(OpType::Squeeze, params.clone()))
            .add(LayoutTransformation::new(OpType::Transpose, params.clone()))
            .add(LayoutTransformation::new(OpType::Unsqueeze, params.clone()))
            .add_cleanup(FuseConvertTransformation::new(params.clone()))
            .add_cleanup(FuseFakeQuantizeTransformation::new(params.clone()))
            .add_standalone_cleanup(FuseSubtractToFakeQuantizeTransformation::new(params.clone()))
            .add_standalone_cleanup(FuseMultiplyToFakeQuantizeTransformation::new(params.clone()))
            .add_standalone_cleanup(SubtractMultiplyToMultiplyAddTransformation::new(params))
    }

    pub fn add_branch_specific<T: LayerTransformation + 'static>(mut self, transformation: T) -> Self {
        insert(&mut self.branch_specific, Box::new(transformation));
        self
    }

    /// Add a general transformation
    pub fn add<T: LayerTransformation + 'static>(mut self, transformation: T) -> Self {
        insert(&mut self.transformations, Box::new(transformation));
        self
    }

    pub fn add_cleanup<T: LayerTransformation + 'static>(mut self, transformation: T) -> Self {
        insert(&mut self.cleanup, Box::new(transformation));
        self
    }

    /// Standalone cleanups run one full traversal each, in insertion order
    pub fn add_standalone_cleanup<T: LayerTransformation + 'static>(mut self, transformation: T) -> Self {
        self.standalone_cleanup.push(Box::new(transformation));
        self
    }

    /// Remove the branch-specific, general and cleanup transformations for `op_type`
    pub fn remove(&mut self, op_type: OpType) -> &mut Self {
        self.remove_branch_specific(op_type)
            .remove_transformations(op_type)
            .remove_cleanup(op_type)
    }

    pub fn remove_branch_specific(&mut self, op_type: OpType) -> &mut Self {
        self.branch_specific.remove(&op_type);
        self
    }

    pub fn remove_transformations(&mut self, op_type: OpType) -> &mut Self {
        self.transformations.remove(&op_type);
        self
    }

    pub fn remove_cleanup(&mut self, op_type: OpType) -> &mut Self {
        self.cleanup.remove(&op_type);
        self
    }

    /// Every transformation registered for `op_type`, across all buckets
    pub fn find(&self, op_type: OpType) -> Vec<&dyn LayerTransformation> {
        let keyed = [&self.branch_specific, &self.transformations, &self.cleanup]
            .into_iter()
            .filter_map(|bucket| bucket.get(&op_type))
            .flatten()
            .map(|t| t.as_ref());
        let standalone = self
            .standalone_cleanup
            .iter()
            .filter(|t| t.matched_op() == op_type)
            .map(|t| t.as_ref());
        keyed.chain(standalone).collect()
    }

    pub fn branch_specific(&self, op_type: OpType) -> Vec<&dyn LayerTransformation> {
        bucket_entries(&self.branch_specific, op_type)
    }

    pub fn transformations(&self, op_type: OpType) -> Vec<&dyn LayerTransformation> {
        bucket_entries(&self.transformations, op_type)
    }

    pub fn cleanup(&self, op_type: OpType) -> Vec<&dyn LayerTransformation> {
        bucket_entries(&self.cleanup, op_type)
    }

    pub fn standalone_cleanup(&self) -> impl Iterator<Item = &dyn LayerTransformation> {
        self.standalone_cleanup.iter().map(|t| t.as_ref())
    }

    /// Keys of the general bucket, in iteration order
    pub fn transformation_keys(&self) -> Vec<OpType> {
        self.transformations.keys().copied().collect()
    }

    pub fn branch_specific_keys(&self) -> Vec<OpType> {
        self.branch_specific.keys().copied().collect()
    }

    pub fn cleanup_keys(&self) -> Vec<OpType> {
        self.cleanup.keys().copied().collect()
    }

    /// Toggle precision updates on branch-specific and general transformations
    pub fn set_update_precisions(&mut self, update_precisions: bool) -> &mut Self {
        for transformation in self.branch_specific_and_general_mut() {
            transformation.params_mut().update_precisions = update_precisions;
        }
        self
    }

    /// Toggle zero-point support on branch-specific and general transformations
    pub fn set_support_asymmetric_quantization(&mut self, support: bool) -> &mut Self {
        for transformation in self.branch_specific_and_general_mut() {
            transformation.params_mut().support_asymmetric_quantization = support;
        }
        self
    }

    fn branch_specific_and_general_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn LayerTransformation>> {
        self.branch_specific
            .values_mut()
            .chain(self.transformations.values_mut())
            .flatten()
    }
}

fn insert(bucket: &mut Bucket, transformation: Box<dyn LayerTransformation>) {
    bucket.entry(transformation.matched_op()).or_default().push(transformation);
}

fn bucket_entries(bucket: &Bucket, op_type: OpType) -> Vec<&dyn LayerTransformation> {
    bucket
        .get(&op_type)
        .map(|entries| entries.iter().map(|t| t.as_ref()).collect())
        .unwrap_or_default()
}
