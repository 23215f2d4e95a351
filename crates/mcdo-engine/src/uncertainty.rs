//! Probability-space statistics of a pass ensemble.
//!
//! Decomposes predictive uncertainty into epistemic (mutual information between
//! prediction and dropout realisation) and aleatoric (expected per-pass entropy)
//! components.

use ndarray::{Array3, Array5, Axis, Zip};
use segmentation_core::Tensor4;

/// Floor applied to probabilities before taking logarithms.
pub const PROB_FLOOR: f32 = 1e-9;

/// Numerically stable softmax over the class axis.
pub fn softmax_classes(logits: &Tensor4) -> Tensor4 {
    let mut probs = logits.clone();
    for mut pixel in probs.lanes_mut(Axis(1)) {
        let max = pixel.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        pixel.mapv_inplace(|v| (v - max).exp());
        let sum = pixel.sum();
        pixel.mapv_inplace(|v| v / sum);
    }
    probs
}

/// Mean and variance over the trailing ensemble axis. Variance is clamped at zero.
pub fn moments(probs: &Array5<f32>) -> (Tensor4, Tensor4) {
    let n = probs.len_of(Axis(4)).max(1) as f32;
    let mean = probs.sum_axis(Axis(4)) / n;
    let second = probs.mapv(|p| p * p).sum_axis(Axis(4)) / n;
    let mut variance = second - &mean * &mean;
    variance.mapv_inplace(|v| v.max(0.0));
    (mean, variance)
}

fn entropy_of(probs: impl Iterator<Item = f32>) -> f32 {
    probs
        .map(|p| {
            let p = p.max(PROB_FLOOR);
            -p * p.ln()
        })
        .sum()
}

/// Per-pixel entropy of the mean distribution and mutual information
/// `H[E[p]] - E[H[p]]`, both shaped `(batch, rows, cols)`.
pub fn entropy_and_mutual_information(probs: &Array5<f32>, mean: &Tensor4) -> (Array3<f32>, Array3<f32>) {
    let (batch, _, rows, cols, passes) = probs.dim();
    let mut entropy = Array3::<f32>::zeros((batch, rows, cols));
    let mut mutual_information = Array3::<f32>::zeros((batch, rows, cols));

    Zip::indexed(&mut entropy)
        .and(&mut mutual_information)
        .for_each(|(b, r, c), h, mi| {
            let total = entropy_of(mean.slice(ndarray::s![b, .., r, c]).iter().copied());
            let expected = (0..passes)
                .map(|k| entropy_of(probs.slice(ndarray::s![b, .., r, c, k]).iter().copied()))
                .sum::<f32>()
                / passes.max(1) as f32;
            *h = total;
            *mi = (total - expected).max(0.0);
        });

    (entropy, mutual_information)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{stack, Array4};

    fn ensemble(passes: &[Tensor4]) -> Array5<f32> {
        let views: Vec<_> = passes.iter().map(|p| p.view()).collect();
        stack(Axis(4), &views).unwrap()
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let logits = Array4::from_shape_fn((2, 4, 3, 3), |(b, c, r, w)| (b + c * r) as f32 - w as f32 * 40.0);
        let probs = softmax_classes(&logits);
        for pixel in probs.lanes(Axis(1)) {
            assert_abs_diff_eq!(pixel.sum(), 1.0, epsilon = 1e-5);
            assert!(pixel.iter().all(|p| *p >= 0.0));
        }
    }

    #[test]
    fn test_variance_non_negative_for_identical_passes() {
        let p = softmax_classes(&Array4::from_shape_fn((1, 3, 2, 2), |(_, c, r, w)| {
            (c as f32 * 0.37 + r as f32 * 1.1 - w as f32) * 3.0
        }));
        let (mean, variance) = moments(&ensemble(&[p.clone(), p.clone(), p.clone()]));
        assert!(variance.iter().all(|v| *v >= 0.0));
        for (m, q) in mean.iter().zip(p.iter()) {
            assert_abs_diff_eq!(*m, *q, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_moments_of_two_point_ensemble() {
        let a = Array4::from_elem((1, 2, 1, 1), 0.5f32);
        let mut b = Array4::zeros((1, 2, 1, 1));
        b[[0, 0, 0, 0]] = 1.0;
        let (mean, variance) = moments(&ensemble(&[a, b]));
        assert_abs_diff_eq!(mean[[0, 0, 0, 0]], 0.75, epsilon = 1e-6);
        assert_abs_diff_eq!(variance[[0, 0, 0, 0]], 0.0625, epsilon = 1e-6);
    }

    #[test]
    fn test_mutual_information_zero_when_passes_agree() {
        let p = Array4::from_elem((1, 4, 2, 2), 0.25f32);
        let probs = ensemble(&[p.clone(), p]);
        let (mean, _) = moments(&probs);
        let (entropy, mi) = entropy_and_mutual_information(&probs, &mean);
        for h in entropy.iter() {
            assert_abs_diff_eq!(*h, 4.0f32.ln(), epsilon = 1e-5);
        }
        assert!(mi.iter().all(|v| v.abs() < 1e-5));
    }

    #[test]
    fn test_mutual_information_positive_when_passes_disagree() {
        let mut a = Array4::zeros((1, 2, 1, 1));
        a[[0, 0, 0, 0]] = 1.0;
        let mut b = Array4::zeros((1, 2, 1, 1));
        b[[0, 1, 0, 0]] = 1.0;
        let probs = ensemble(&[a, b]);
        let (mean, _) = moments(&probs);
        let (entropy, mi) = entropy_and_mutual_information(&probs, &mean);
        assert!(entropy.iter().all(|h| h.is_finite()));
        assert_abs_diff_eq!(mi[[0, 0, 0]], 2.0f32.ln(), epsilon = 1e-4);
    }
}
