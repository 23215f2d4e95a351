//! Scaling of the MCDO mean before fusion.
//!
//! Each module yields an exponent map `f` of shape `(batch, rows, cols)`; the mean is
//! replaced by `p^f` renormalised over classes. `f < 1` flattens the distribution,
//! which is how uncertain pixels (or images) are softened.

use ndarray::{Array3, Axis};
use segmentation_core::{normalize_classes, ScalingKind, SegError, SegResult, Tensor4};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ScalingModule {
    None,
    /// Constant temperature.
    Temperature { temperature: f32 },
    /// Per-pixel temperature `1 + weight * H / ln C` from predictive entropy.
    Uncertainty { weight: f32 },
    /// Per-image temperature `1 + weight * mean(MI) / ln C`.
    GlobalUncertainty { weight: f32 },
}

impl ScalingModule {
    pub fn from_kind(kind: ScalingKind) -> Self {
        match kind {
            ScalingKind::None => ScalingModule::None,
            ScalingKind::Temperature => ScalingModule::Temperature { temperature: 1.5 },
            ScalingKind::Uncertainty => ScalingModule::Uncertainty { weight: 1.0 },
            ScalingKind::GlobalUncertainty => ScalingModule::GlobalUncertainty { weight: 1.0 },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScalingModule::None => "None",
            ScalingModule::Temperature { .. } => "temperature",
            ScalingModule::Uncertainty { .. } => "uncertainty",
            ScalingModule::GlobalUncertainty { .. } => "GlobalUncertainty",
        }
    }

    /// Exponent applied to each pixel's class distribution.
    pub fn exponents(
        &self,
        n_classes: usize,
        entropy: &Array3<f32>,
        mutual_information: &Array3<f32>,
    ) -> Array3<f32> {
        let log_c = (n_classes.max(2) as f32).ln();
        match *self {
            ScalingModule::None => Array3::ones(entropy.raw_dim()),
            ScalingModule::Temperature { temperature } => {
                Array3::from_elem(entropy.raw_dim(), 1.0 / temperature.max(f32::EPSILON))
            }
            ScalingModule::Uncertainty { weight } => {
                entropy.mapv(|h| 1.0 / (1.0 + weight * h.max(0.0) / log_c))
            }
            ScalingModule::GlobalUncertainty { weight } => {
                let mut exponents = Array3::ones(mutual_information.raw_dim());
                for (image, mut out) in mutual_information
                    .axis_iter(Axis(0))
                    .zip(exponents.axis_iter_mut(Axis(0)))
                {
                    let mi = image.mean().unwrap_or(0.0).max(0.0);
                    out.fill(1.0 / (1.0 + weight * mi / log_c));
                }
                exponents
            }
        }
    }

    /// Scale `mean` in place using the ensemble's entropy and mutual-information maps.
    pub fn apply(
        &self,
        mean: &mut Tensor4,
        entropy: &Array3<f32>,
        mutual_information: &Array3<f32>,
    ) -> SegResult<()> {
        if matches!(self, ScalingModule::None) {
            return Ok(());
        }
        let (batch, n_classes, rows, cols) = mean.dim();
        for map in [entropy, mutual_information] {
            if map.dim() != (batch, rows, cols) {
                return Err(SegError::ShapeMismatch {
                    context: format!("{} scaling", self.name()),
                    expected: vec![batch, rows, cols],
                    actual: map.shape().to_vec(),
                });
            }
        }

        let exponents = self.exponents(n_classes, entropy, mutual_information);
        for mut channel in mean.axis_iter_mut(Axis(1)) {
            channel.zip_mut_with(&exponents, |p, &f| *p = p.max(0.0).powf(f));
        }
        normalize_classes(mean);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn two_pixel_mean() -> Tensor4 {
        Tensor4::from_shape_fn((2, 2, 1, 2), |(_, k, _, _)| if k == 0 { 0.8 } else { 0.2 })
    }

    #[test]
    fn test_none_and_unit_maps_leave_mean_untouched() {
        let mut mean = two_pixel_mean();
        let zeros = Array3::zeros((2, 1, 2));
        ScalingModule::None.apply(&mut mean, &zeros, &zeros).unwrap();
        assert_eq!(mean, two_pixel_mean());

        ScalingModule::Uncertainty { weight: 1.0 }
            .apply(&mut mean, &zeros, &zeros)
            .unwrap();
        assert_relative_eq!(mean[[0, 0, 0, 0]], 0.8, epsilon = 1e-6);
    }

    #[test]
    fn test_temperature_flattens() {
        let mut mean = two_pixel_mean();
        let zeros = Array3::zeros((2, 1, 2));
        ScalingModule::Temperature { temperature: 2.0 }
            .apply(&mut mean, &zeros, &zeros)
            .unwrap();
        // sqrt(0.8) / (sqrt(0.8) + sqrt(0.2)) = 2/3
        assert_relative_eq!(mean[[1, 0, 0, 1]], 2.0 / 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_uncertainty_is_per_pixel() {
        let mut mean = two_pixel_mean();
        let mut entropy = Array3::zeros((2, 1, 2));
        entropy[[0, 0, 1]] = 2f32.ln();
        ScalingModule::Uncertainty { weight: 1.0 }
            .apply(&mut mean, &entropy, &Array3::zeros((2, 1, 2)))
            .unwrap();
        assert_relative_eq!(mean[[0, 0, 0, 0]], 0.8, epsilon = 1e-6);
        assert_relative_eq!(mean[[0, 0, 0, 1]], 2.0 / 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_global_uncertainty_is_per_image() {
        let mut mean = two_pixel_mean();
        let mut mi = Array3::zeros((2, 1, 2));
        mi[[1, 0, 0]] = 2.0 * 2f32.ln();
        ScalingModule::GlobalUncertainty { weight: 1.0 }
            .apply(&mut mean, &Array3::zeros((2, 1, 2)), &mi)
            .unwrap();
        assert_relative_eq!(mean[[0, 0, 0, 1]], 0.8, epsilon = 1e-6);
        assert_relative_eq!(mean[[1, 0, 0, 0]], 2.0 / 3.0, epsilon = 1e-6);
        assert_relative_eq!(mean[[1, 0, 0, 1]], 2.0 / 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_rejects_mismatched_maps() {
        let mut mean = two_pixel_mean();
        let err = ScalingModule::from_kind(ScalingKind::Uncertainty)
            .apply(&mut mean, &Array3::zeros((1, 1, 2)), &Array3::zeros((2, 1, 2)))
            .unwrap_err();
        assert!(matches!(err, SegError::ShapeMismatch { .. }));
    }
}
