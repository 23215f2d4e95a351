//! Fusion Strategy
//!
//! Combines per-modality MCDO means and variances into one class distribution. Policies
//! are selected with [`build`] from a [`segmentation_core::FusionKind`]; scaling modules
//! soften each modality's mean by its uncertainty before fusion.

pub mod scaling;
pub mod strategy;

pub use scaling::ScalingModule;
pub use strategy::{
    build, reduce_variance, ConditionalAttention, Gated, NoisyOr, PreweightedGated,
    ScaledAverage, SingleModality, SoftmaxAverage, SoftmaxMultiply, UncertaintyGated,
    WeightedVariance, VARIANCE_EPS,
};
