use ndarray::Axis;

use crate::types::Tensor4;

/// Normalise over the class axis in place. Negative and non-finite scores count as
/// zero; pixels without mass become uniform.
pub fn normalize_classes(scores: &mut Tensor4) {
    let n_classes = scores.len_of(Axis(1));
    if n_classes == 0 {
        return;
    }
    let uniform = 1.0 / n_classes as f32;
    for mut pixel in scores.lanes_mut(Axis(1)) {
        pixel.mapv_inplace(|v| if v.is_finite() { v.max(0.0) } else { 0.0 });
        let total = pixel.sum();
        if total > 0.0 {
            pixel /= total;
        } else {
            pixel.fill(uniform);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array4;

    #[test]
    fn test_normalize_handles_zero_pixels() {
        let mut scores = Array4::zeros((1, 4, 1, 2));
        scores[[0, 1, 0, 1]] = 3.0;
        scores[[0, 2, 0, 1]] = 1.0;
        normalize_classes(&mut scores);
        assert_abs_diff_eq!(scores[[0, 0, 0, 0]], 0.25);
        assert_abs_diff_eq!(scores[[0, 1, 0, 1]], 0.75);
        assert_abs_diff_eq!(scores[[0, 2, 0, 1]], 0.25);
    }

    #[test]
    fn test_normalize_drops_negative_and_nan_scores() {
        let mut scores = Array4::zeros((2, 3, 1, 1));
        scores[[0, 0, 0, 0]] = -2.0;
        scores[[0, 1, 0, 0]] = f32::NAN;
        scores[[0, 2, 0, 0]] = 0.5;
        scores[[1, 0, 0, 0]] = f32::INFINITY;
        scores[[1, 1, 0, 0]] = -1.0;
        normalize_classes(&mut scores);

        assert_abs_diff_eq!(scores[[0, 0, 0, 0]], 0.0);
        assert_abs_diff_eq!(scores[[0, 1, 0, 0]], 0.0);
        assert_abs_diff_eq!(scores[[0, 2, 0, 0]], 1.0);
        for k in 0..3 {
            assert_abs_diff_eq!(scores[[1, k, 0, 0]], 1.0 / 3.0);
        }
    }
}
