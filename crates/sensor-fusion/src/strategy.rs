//! Fusion policies over per-modality MCDO means and variances.
//!
//! Every policy returns a class distribution normalised over the class axis. Gated
//! policies compute one weight per modality (or per modality and class) with a
//! softmax over modalities, then sum the weighted means.

use std::collections::BTreeMap;

use ndarray::{Array, Array3, Axis, Dimension, Zip};
use segmentation_core::{
    normalize_classes, FusionKind, FusionStrategy, Modality, SegError, SegResult, Tensor4,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Added to the mean variance before inverting it.
pub const VARIANCE_EPS: f32 = 1e-5;

const DEFAULT_SHARPNESS: f32 = 5.0;

/// Reduce a per-class variance to a single channel by averaging over classes.
pub fn reduce_variance(variance: &Tensor4) -> Tensor4 {
    match variance.mean_axis(Axis(1)) {
        Some(mean) => mean.insert_axis(Axis(1)),
        None => variance.clone(),
    }
}

struct Input<'a> {
    modality: &'a Modality,
    mean: &'a Tensor4,
    variance: Option<&'a Tensor4>,
}

fn collect_inputs<'a>(
    means: &'a BTreeMap<Modality, Tensor4>,
    variances: &'a BTreeMap<Modality, Tensor4>,
    needs_variance: bool,
) -> SegResult<Vec<Input<'a>>> {
    let first = means.values().next().ok_or(SegError::EmptyModalities)?;
    let (batch, _, rows, cols) = first.dim();

    let mut inputs = Vec::with_capacity(means.len());
    for (modality, mean) in means {
        if mean.shape() != first.shape() {
            return Err(SegError::ShapeMismatch {
                context: format!("fusing mean of modality {}", modality),
                expected: first.shape().to_vec(),
                actual: mean.shape().to_vec(),
            });
        }
        let variance = variances.get(modality);
        match variance {
            Some(v) => {
                let (vb, vc, vr, vw) = v.dim();
                let channels_ok = vc == 1 || vc == mean.len_of(Axis(1));
                if vb != batch || vr != rows || vw != cols || !channels_ok {
                    return Err(SegError::ShapeMismatch {
                        context: format!("fusing variance of modality {}", modality),
                        expected: vec![batch, 1, rows, cols],
                        actual: v.shape().to_vec(),
                    });
                }
            }
            None if needs_variance => {
                return Err(SegError::ShapeMismatch {
                    context: format!("missing variance for modality {}", modality),
                    expected: vec![batch, 1, rows, cols],
                    actual: Vec::new(),
                });
            }
            None => {}
        }
        inputs.push(Input {
            modality,
            mean,
            variance,
        });
    }
    Ok(inputs)
}

/// Per-pixel mean variance, shape `(batch, rows, cols)`.
fn pixel_variance(variance: &Tensor4) -> Array3<f32> {
    let (batch, _, rows, cols) = variance.dim();
    variance
        .mean_axis(Axis(1))
        .unwrap_or_else(|| Array3::zeros((batch, rows, cols)))
}

fn max_probability(mean: &Tensor4) -> Array3<f32> {
    mean.fold_axis(Axis(1), f32::NEG_INFINITY, |acc, &v| acc.max(v))
}

/// Softmax across a list of per-modality score maps.
fn softmax_over_modalities<D: Dimension>(scores: Vec<Array<f32, D>>) -> Vec<Array<f32, D>> {
    let Some(first) = scores.first() else {
        return scores;
    };
    let mut max = first.clone();
    for score in &scores[1..] {
        Zip::from(&mut max).and(score).for_each(|m, &v| *m = m.max(v));
    }
    let mut exps: Vec<Array<f32, D>> = scores
        .into_iter()
        .map(|mut score| {
            Zip::from(&mut score).and(&max).for_each(|v, &m| *v = (*v - m).exp());
            score
        })
        .collect();
    let mut total = Array::<f32, D>::zeros(max.raw_dim());
    for e in &exps {
        total += e;
    }
    for e in &mut exps {
        *e /= &total;
    }
    exps
}

/// Sum of means weighted by per-pixel gates, normalised over classes.
fn gated_sum(inputs: &[Input<'_>], gates: &[Array3<f32>]) -> Tensor4 {
    let mut fused = Tensor4::zeros(inputs[0].mean.raw_dim());
    for (input, gate) in inputs.iter().zip(gates) {
        let gate = gate.view().insert_axis(Axis(1));
        fused = fused + &gate * input.mean;
    }
    normalize_classes(&mut fused);
    fused
}

/// Softmax of the first configured modality alone (`None`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleModality {
    pub primary: Modality,
}

impl Default for SingleModality {
    fn default() -> Self {
        Self {
            primary: Modality::rgb(),
        }
    }
}

impl FusionStrategy for SingleModality {
    fn name(&self) -> &'static str {
        "None"
    }

    fn fuse(
        &self,
        means: &BTreeMap<Modality, Tensor4>,
        variances: &BTreeMap<Modality, Tensor4>,
    ) -> SegResult<Tensor4> {
        let inputs = collect_inputs(means, variances, false)?;
        let chosen = inputs
            .iter()
            .find(|input| input.modality == &self.primary)
            .unwrap_or(&inputs[0]);
        let mut fused = chosen.mean.clone();
        normalize_classes(&mut fused);
        Ok(fused)
    }
}

/// Product of the per-modality distributions.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SoftmaxMultiply;

impl FusionStrategy for SoftmaxMultiply {
    fn name(&self) -> &'static str {
        "SoftmaxMultiply"
    }

    fn fuse(
        &self,
        means: &BTreeMap<Modality, Tensor4>,
        variances: &BTreeMap<Modality, Tensor4>,
    ) -> SegResult<Tensor4> {
        let inputs = collect_inputs(means, variances, false)?;
        let mut fused = Tensor4::ones(inputs[0].mean.raw_dim());
        for input in &inputs {
            fused *= input.mean;
        }
        normalize_classes(&mut fused);
        Ok(fused)
    }
}

/// Sum of the per-modality distributions.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SoftmaxAverage;

impl FusionStrategy for SoftmaxAverage {
    fn name(&self) -> &'static str {
        "SoftmaxAverage"
    }

    fn fuse(
        &self,
        means: &BTreeMap<Modality, Tensor4>,
        variances: &BTreeMap<Modality, Tensor4>,
    ) -> SegResult<Tensor4> {
        let inputs = collect_inputs(means, variances, false)?;
        let mut fused = Tensor4::zeros(inputs[0].mean.raw_dim());
        for input in &inputs {
            fused += input.mean;
        }
        normalize_classes(&mut fused);
        Ok(fused)
    }
}

/// Each modality weighted per pixel by `1 / (mean variance + eps)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WeightedVariance {
    pub eps: f32,
}

impl Default for WeightedVariance {
    fn default() -> Self {
        Self { eps: VARIANCE_EPS }
    }
}

impl FusionStrategy for WeightedVariance {
    fn name(&self) -> &'static str {
        "WeightedVariance"
    }

    fn fuse(
        &self,
        means: &BTreeMap<Modality, Tensor4>,
        variances: &BTreeMap<Modality, Tensor4>,
    ) -> SegResult<Tensor4> {
        let inputs = collect_inputs(means, variances, true)?;
        let weights: Vec<Array3<f32>> = inputs
            .iter()
            .filter_map(|input| input.variance)
            .map(|v| pixel_variance(v).mapv(|m| 1.0 / (m.max(0.0) + self.eps)))
            .collect();
        Ok(gated_sum(&inputs, &weights))
    }
}

/// `1 - prod(1 - p)` per class.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NoisyOr;

impl FusionStrategy for NoisyOr {
    fn name(&self) -> &'static str {
        "Noisy-Or"
    }

    fn fuse(
        &self,
        means: &BTreeMap<Modality, Tensor4>,
        variances: &BTreeMap<Modality, Tensor4>,
    ) -> SegResult<Tensor4> {
        let inputs = collect_inputs(means, variances, false)?;
        let mut miss = Tensor4::ones(inputs[0].mean.raw_dim());
        for input in &inputs {
            Zip::from(&mut miss)
                .and(input.mean)
                .for_each(|m, &p| *m *= 1.0 - p.clamp(0.0, 1.0));
        }
        let mut fused = miss.mapv(|m| 1.0 - m);
        normalize_classes(&mut fused);
        Ok(fused)
    }
}

/// Static per-modality weights. Modalities without a weight count as 1.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScaledAverage {
    pub weights: BTreeMap<Modality, f32>,
}

impl FusionStrategy for ScaledAverage {
    fn name(&self) -> &'static str {
        "ScaledAverage"
    }

    fn fuse(
        &self,
        means: &BTreeMap<Modality, Tensor4>,
        variances: &BTreeMap<Modality, Tensor4>,
    ) -> SegResult<Tensor4> {
        let inputs = collect_inputs(means, variances, false)?;
        let mut fused = Tensor4::zeros(inputs[0].mean.raw_dim());
        for input in &inputs {
            let w = self.weights.get(input.modality).copied().unwrap_or(1.0).max(0.0);
            fused.scaled_add(w, input.mean);
        }
        normalize_classes(&mut fused);
        Ok(fused)
    }
}

/// Per-pixel gate: softmax over modalities of `sharpness * max_c p`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Gated {
    pub sharpness: f32,
}

impl Default for Gated {
    fn default() -> Self {
        Self {
            sharpness: DEFAULT_SHARPNESS,
        }
    }
}

impl FusionStrategy for Gated {
    fn name(&self) -> &'static str {
        "GatedFusion"
    }

    fn fuse(
        &self,
        means: &BTreeMap<Modality, Tensor4>,
        variances: &BTreeMap<Modality, Tensor4>,
    ) -> SegResult<Tensor4> {
        let inputs = collect_inputs(means, variances, false)?;
        let scores = inputs
            .iter()
            .map(|input| max_probability(input.mean) * self.sharpness)
            .collect();
        Ok(gated_sum(&inputs, &softmax_over_modalities(scores)))
    }
}

/// Per-pixel, per-class gate: softmax over modalities of `sharpness * p_c`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConditionalAttention {
    pub sharpness: f32,
}

impl Default for ConditionalAttention {
    fn default() -> Self {
        Self {
            sharpness: DEFAULT_SHARPNESS,
        }
    }
}

impl FusionStrategy for ConditionalAttention {
    fn name(&self) -> &'static str {
        "ConditionalAttentionFusion"
    }

    fn fuse(
        &self,
        means: &BTreeMap<Modality, Tensor4>,
        variances: &BTreeMap<Modality, Tensor4>,
    ) -> SegResult<Tensor4> {
        let inputs = collect_inputs(means, variances, false)?;
        let scores = inputs.iter().map(|input| input.mean * self.sharpness).collect();
        let gates = softmax_over_modalities(scores);

        let mut fused = Tensor4::zeros(inputs[0].mean.raw_dim());
        for (input, gate) in inputs.iter().zip(&gates) {
            fused = fused + gate * input.mean;
        }
        normalize_classes(&mut fused);
        Ok(fused)
    }
}

/// Gated fusion with static prior weights: gate ∝ `w_m * exp(sharpness * max_c p)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreweightedGated {
    pub pre_weights: BTreeMap<Modality, f32>,
    pub sharpness: f32,
}

impl Default for PreweightedGated {
    fn default() -> Self {
        Self {
            pre_weights: BTreeMap::new(),
            sharpness: DEFAULT_SHARPNESS,
        }
    }
}

impl FusionStrategy for PreweightedGated {
    fn name(&self) -> &'static str {
        "PreweightedGatedFusion"
    }

    fn fuse(
        &self,
        means: &BTreeMap<Modality, Tensor4>,
        variances: &BTreeMap<Modality, Tensor4>,
    ) -> SegResult<Tensor4> {
        let inputs = collect_inputs(means, variances, false)?;
        let scores = inputs
            .iter()
            .map(|input| {
                let prior = self
                    .pre_weights
                    .get(input.modality)
                    .copied()
                    .unwrap_or(1.0)
                    .max(f32::MIN_POSITIVE);
                max_probability(input.mean) * self.sharpness + prior.ln()
            })
            .collect();
        Ok(gated_sum(&inputs, &softmax_over_modalities(scores)))
    }
}

/// Per-pixel gate: softmax over modalities of `-sharpness * mean variance`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UncertaintyGated {
    pub sharpness: f32,
}

impl Default for UncertaintyGated {
    fn default() -> Self {
        Self { sharpness: 100.0 }
    }
}

impl FusionStrategy for UncertaintyGated {
    fn name(&self) -> &'static str {
        "UncertaintyGatedFusion"
    }

    fn fuse(
        &self,
        means: &BTreeMap<Modality, Tensor4>,
        variances: &BTreeMap<Modality, Tensor4>,
    ) -> SegResult<Tensor4> {
        let inputs = collect_inputs(means, variances, true)?;
        let scores = inputs
            .iter()
            .filter_map(|input| input.variance)
            .map(|v| pixel_variance(v) * -self.sharpness)
            .collect();
        Ok(gated_sum(&inputs, &softmax_over_modalities(scores)))
    }
}

/// Construct the default-parameterised policy for `kind`.
pub fn build(kind: FusionKind) -> Box<dyn FusionStrategy> {
    let strategy: Box<dyn FusionStrategy> = match kind {
        FusionKind::None => Box::new(SingleModality::default()),
        FusionKind::SoftmaxMultiply => Box::new(SoftmaxMultiply),
        FusionKind::SoftmaxAverage => Box::new(SoftmaxAverage),
        FusionKind::WeightedVariance => Box::new(WeightedVariance::default()),
        FusionKind::NoisyOr => Box::new(NoisyOr),
        FusionKind::ScaledAverage => Box::new(ScaledAverage::default()),
        FusionKind::Gated => Box::new(Gated::default()),
        FusionKind::ConditionalAttention => Box::new(ConditionalAttention::default()),
        FusionKind::PreweightedGated => Box::new(PreweightedGated::default()),
        FusionKind::UncertaintyGated => Box::new(UncertaintyGated::default()),
    };
    debug!(policy = strategy.name(), "Built fusion strategy");
    strategy
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const ALL_KINDS: [FusionKind; 10] = [
        FusionKind::None,
        FusionKind::SoftmaxMultiply,
        FusionKind::SoftmaxAverage,
        FusionKind::WeightedVariance,
        FusionKind::NoisyOr,
        FusionKind::ScaledAverage,
        FusionKind::Gated,
        FusionKind::ConditionalAttention,
        FusionKind::PreweightedGated,
        FusionKind::UncertaintyGated,
    ];

    fn dist(p: [f32; 2]) -> Tensor4 {
        Tensor4::from_shape_fn((1, 2, 2, 2), |(_, k, _, _)| p[k])
    }

    fn constant_var(v: f32) -> Tensor4 {
        Tensor4::from_elem((1, 1, 2, 2), v)
    }

    fn two_modalities() -> (BTreeMap<Modality, Tensor4>, BTreeMap<Modality, Tensor4>) {
        let means = BTreeMap::from([
            (Modality::rgb(), dist([0.8, 0.2])),
            (Modality::depth(), dist([0.4, 0.6])),
        ]);
        let variances = BTreeMap::from([
            (Modality::rgb(), constant_var(0.1)),
            (Modality::depth(), constant_var(0.3)),
        ]);
        (means, variances)
    }

    #[test]
    fn test_reduce_variance_averages_classes() {
        let var = Tensor4::from_shape_fn((1, 4, 1, 1), |(_, k, _, _)| k as f32);
        let reduced = reduce_variance(&var);
        assert_eq!(reduced.shape(), &[1, 1, 1, 1]);
        assert_relative_eq!(reduced[[0, 0, 0, 0]], 1.5);
    }

    #[test]
    fn test_average_and_product() {
        let (means, variances) = two_modalities();
        let avg = SoftmaxAverage.fuse(&means, &variances).unwrap();
        assert_relative_eq!(avg[[0, 0, 1, 1]], 0.6, epsilon = 1e-6);

        let prod = SoftmaxMultiply.fuse(&means, &variances).unwrap();
        assert_relative_eq!(prod[[0, 0, 0, 0]], 0.32 / 0.44, epsilon = 1e-6);
    }

    #[test]
    fn test_noisy_or() {
        let (means, variances) = two_modalities();
        let fused = NoisyOr.fuse(&means, &variances).unwrap();
        assert_relative_eq!(fused[[0, 0, 0, 1]], 0.88 / 1.56, epsilon = 1e-6);
    }

    #[test]
    fn test_weighted_variance_prefers_confident_modality() {
        let (means, variances) = two_modalities();
        let fused = WeightedVariance::default().fuse(&means, &variances).unwrap();
        // weights are close to 3:1 in favour of rgb
        assert_relative_eq!(fused[[0, 0, 0, 0]], 0.7, epsilon = 1e-3);
    }

    #[test]
    fn test_per_class_variance_is_reduced() {
        let (means, _) = two_modalities();
        let variances = BTreeMap::from([
            (Modality::rgb(), Tensor4::from_elem((1, 2, 2, 2), 0.1)),
            (Modality::depth(), constant_var(0.3)),
        ]);
        let fused = WeightedVariance::default().fuse(&means, &variances).unwrap();
        assert_relative_eq!(fused[[0, 0, 1, 0]], 0.7, epsilon = 1e-3);
    }

    #[test]
    fn test_uncertainty_gate_follows_lower_variance() {
        let (means, variances) = two_modalities();
        let fused = UncertaintyGated { sharpness: 1000.0 }
            .fuse(&means, &variances)
            .unwrap();
        assert_relative_eq!(fused[[0, 0, 0, 0]], 0.8, epsilon = 1e-4);
    }

    #[test]
    fn test_gates_favour_the_confident_modality() {
        let (means, variances) = two_modalities();
        let gated = Gated::default().fuse(&means, &variances).unwrap();
        assert!(gated[[0, 0, 0, 0]] > 0.6);

        let prior = PreweightedGated {
            pre_weights: BTreeMap::from([(Modality::depth(), 1.0e6)]),
            sharpness: 1.0,
        };
        let fused = prior.fuse(&means, &variances).unwrap();
        assert_relative_eq!(fused[[0, 0, 0, 0]], 0.4, epsilon = 1e-3);
    }

    #[test]
    fn test_scaled_average_weights() {
        let (means, variances) = two_modalities();
        let strategy = ScaledAverage {
            weights: BTreeMap::from([(Modality::rgb(), 3.0)]),
        };
        let fused = strategy.fuse(&means, &variances).unwrap();
        assert_relative_eq!(fused[[0, 0, 0, 0]], 0.7, epsilon = 1e-6);
    }

    #[test]
    fn test_single_modality_prefers_rgb() {
        let (means, variances) = two_modalities();
        let fused = SingleModality::default().fuse(&means, &variances).unwrap();
        assert_relative_eq!(fused[[0, 0, 0, 0]], 0.8, epsilon = 1e-6);

        let depth_only = BTreeMap::from([(Modality::depth(), dist([0.4, 0.6]))]);
        let fused = SingleModality::default()
            .fuse(&depth_only, &BTreeMap::new())
            .unwrap();
        assert_relative_eq!(fused[[0, 1, 0, 0]], 0.6, epsilon = 1e-6);
    }

    #[test]
    fn test_every_policy_returns_a_distribution() {
        let (means, variances) = two_modalities();
        for kind in ALL_KINDS {
            let strategy = build(kind);
            assert_eq!(strategy.name(), kind.to_string());
            let fused = strategy.fuse(&means, &variances).unwrap();
            assert_eq!(fused.shape(), &[1, 2, 2, 2]);
            for pixel in fused.lanes(Axis(1)) {
                assert!(pixel.iter().all(|v| *v >= 0.0));
                assert_relative_eq!(pixel.sum(), 1.0, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_rejects_empty_and_mismatched_inputs() {
        let empty = BTreeMap::new();
        assert!(matches!(
            SoftmaxAverage.fuse(&empty, &empty),
            Err(SegError::EmptyModalities)
        ));

        let (mut means, variances) = two_modalities();
        means.insert(Modality::new("ir"), Tensor4::zeros((1, 2, 3, 3)));
        assert!(matches!(
            SoftmaxAverage.fuse(&means, &variances),
            Err(SegError::ShapeMismatch { .. })
        ));

        let (means, mut variances) = two_modalities();
        variances.remove(&Modality::depth());
        assert!(WeightedVariance::default().fuse(&means, &variances).is_err());
        assert!(SoftmaxAverage.fuse(&means, &variances).is_ok());
    }
}
