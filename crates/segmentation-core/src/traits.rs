use std::collections::BTreeMap;

use crate::{Modality, SegResult, Tensor4};

/// Per-class confidence correction consumed by the ensemble aggregator.
pub trait ClassRecalibration: Send + Sync {
    fn n_classes(&self) -> usize;

    /// Map a raw class-channel confidence to its calibrated value.
    fn recalibrate(&self, class: usize, confidence: f32) -> f32;
}

/// Combines per-modality MCDO outputs into one class distribution.
///
/// `variances` may carry one channel per class or a single pre-reduced channel.
/// Implementations return a non-negative score tensor with the spatial shape of the inputs.
pub trait FusionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn fuse(
        &self,
        means: &BTreeMap<Modality, Tensor4>,
        variances: &BTreeMap<Modality, Tensor4>,
    ) -> SegResult<Tensor4>;
}
