//! MCDO Ensemble Aggregator.

use std::sync::Arc;

use ndarray::{stack, Array3, Array5, Axis};
use rayon::prelude::*;
use segmentation_core::{
    normalize_classes, ClassRecalibration, ModelConfig, RecalibrationPoint, SegError, SegResult,
    StageName, Tensor4,
};
use tracing::debug;

use crate::stack::LayerStack;
use crate::uncertainty::{entropy_and_mutual_information, moments, softmax_classes};

/// Everything one MCDO sweep produces.
#[derive(Debug, Clone)]
pub struct EnsembleOutput {
    /// Logits of pass 0, the only tracked pass.
    pub backprop: Tensor4,
    pub tape: Option<Vec<(StageName, Tensor4)>>,
    /// Raw logits of every pass, pass index on the trailing axis.
    pub logits: Array5<f32>,
    pub mean: Tensor4,
    pub variance: Tensor4,
    pub entropy: Array3<f32>,
    pub mutual_information: Array3<f32>,
}

impl EnsembleOutput {
    pub fn passes(&self) -> usize {
        self.logits.len_of(Axis(4))
    }
}

/// Runs a [`LayerStack`] `mcdo_passes` times and reduces the ensemble.
pub struct McdoModel {
    stack: LayerStack,
    passes: usize,
    point: RecalibrationPoint,
    recalibration: Option<Arc<dyn ClassRecalibration>>,
    parallel: bool,
}

impl McdoModel {
    pub fn from_config(config: &ModelConfig) -> SegResult<Self> {
        let stack = LayerStack::from_config(config)?;
        Ok(Self::new(stack, config.recalibration_point_kind()?))
    }

    pub fn new(stack: LayerStack, point: RecalibrationPoint) -> Self {
        Self {
            passes: stack.mcdo_passes(),
            stack,
            point,
            recalibration: None,
            parallel: true,
        }
    }

    /// Run passes `1..N` one after the other instead of on the rayon pool.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn set_recalibration(&mut self, recalibration: Arc<dyn ClassRecalibration>) -> SegResult<()> {
        if self.point == RecalibrationPoint::None {
            return Err(SegError::InvalidConfig(
                "a recalibrator was attached but recalibration_point is None".to_string(),
            ));
        }
        self.recalibration = Some(recalibration);
        Ok(())
    }

    pub fn clear_recalibration(&mut self) {
        self.recalibration = None;
    }

    pub fn recalibration_point(&self) -> RecalibrationPoint {
        self.point
    }

    pub fn stack(&self) -> &LayerStack {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut LayerStack {
        &mut self.stack
    }

    pub fn passes(&self) -> usize {
        self.passes
    }

    pub fn train(&mut self) {
        self.stack.train();
    }

    pub fn eval(&mut self) {
        self.stack.eval();
    }

    /// One sweep: fresh masks, pass 0 tracked, passes `1..N` untracked.
    pub fn forward(&mut self, input: &Tensor4) -> SegResult<EnsembleOutput> {
        self.stack.begin_sweep();
        for pass_index in 0..self.passes {
            self.stack.prepare_pass(pass_index)?;
        }

        let first = self.stack.run_pass(input, 0, true)?;
        let stack = &self.stack;
        let rest: Vec<Tensor4> = if self.parallel {
            (1..self.passes)
                .into_par_iter()
                .map(|pass_index| stack.run_pass(input, pass_index, false).map(|out| out.logits))
                .collect::<SegResult<Vec<_>>>()?
        } else {
            (1..self.passes)
                .map(|pass_index| stack.run_pass(input, pass_index, false).map(|out| out.logits))
                .collect::<SegResult<Vec<_>>>()?
        };

        let mut pass_logits = Vec::with_capacity(self.passes);
        pass_logits.push(first.logits.view());
        pass_logits.extend(rest.iter().map(|l| l.view()));
        let logits = stack_views(&pass_logits)?;

        let mut pass_probs: Vec<Tensor4> = std::iter::once(&first.logits)
            .chain(rest.iter())
            .map(softmax_classes)
            .collect();

        let recalibration = self.recalibration.as_deref();
        if let (RecalibrationPoint::BeforeMcdo, Some(recal)) = (self.point, recalibration) {
            for probs in pass_probs.iter_mut() {
                recalibrate_channels(probs, recal);
                probs.mapv_inplace(|v| v.max(0.0));
                normalize_classes(probs);
            }
        }

        let prob_views: Vec<_> = pass_probs.iter().map(|p| p.view()).collect();
        let probs = stack_views(&prob_views)?;
        let (mut mean, variance) = moments(&probs);
        let (entropy, mutual_information) = entropy_and_mutual_information(&probs, &mean);

        if let (RecalibrationPoint::AfterMcdo, Some(recal)) = (self.point, recalibration) {
            recalibrate_channels(&mut mean, recal);
        }

        debug!(
            passes = self.passes,
            mean_variance = variance.mean().unwrap_or(0.0),
            "MCDO sweep complete"
        );

        Ok(EnsembleOutput {
            backprop: first.logits,
            tape: first.tape,
            logits,
            mean,
            variance,
            entropy,
            mutual_information,
        })
    }
}

fn stack_views(views: &[ndarray::ArrayView4<'_, f32>]) -> SegResult<Array5<f32>> {
    stack(Axis(4), views).map_err(|e| SegError::ShapeMismatch {
        context: format!("pass ensemble: {}", e),
        expected: views.first().map(|v| v.shape().to_vec()).unwrap_or_default(),
        actual: views.last().map(|v| v.shape().to_vec()).unwrap_or_default(),
    })
}

/// Map every class channel through its recalibration curve.
pub fn recalibrate_channels(probs: &mut Tensor4, recal: &dyn ClassRecalibration) {
    for (class, mut channel) in probs.axis_iter_mut(Axis(1)).enumerate() {
        channel.mapv_inplace(|v| recal.recalibrate(class, v));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    struct Squash;

    impl ClassRecalibration for Squash {
        fn n_classes(&self) -> usize {
            3
        }

        fn recalibrate(&self, class: usize, confidence: f32) -> f32 {
            if class == 0 {
                confidence * 0.5
            } else {
                confidence
            }
        }
    }

    fn config(passes: usize) -> ModelConfig {
        ModelConfig {
            n_classes: 3,
            in_channels: 2,
            batch_size: 2,
            img_rows: 32,
            img_cols: 32,
            reduction: 1.0 / 64.0,
            mcdo_passes: passes,
            dropout_p: 0.3,
            seed: Some(9),
            ..Default::default()
        }
    }

    fn input() -> Tensor4 {
        Tensor4::from_shape_fn((2, 2, 32, 32), |(b, c, r, w)| {
            ((b * 13 + c * 5 + r * 3 + w * 7) % 17) as f32 / 17.0 - 0.3
        })
    }

    #[test]
    fn test_output_shapes_and_non_negative_variance() {
        let mut model = McdoModel::from_config(&config(5)).unwrap();
        model.eval();
        let out = model.forward(&input()).unwrap();

        assert_eq!(out.passes(), 5);
        assert_eq!(out.mean.dim(), (2, 3, 32, 32));
        assert_eq!(out.variance.dim(), (2, 3, 32, 32));
        assert_eq!(out.entropy.dim(), (2, 32, 32));
        assert!(out.variance.iter().all(|v| *v >= 0.0));
        assert!(out.mutual_information.iter().all(|v| *v >= 0.0));
        for pixel in out.mean.lanes(Axis(1)) {
            assert_abs_diff_eq!(pixel.sum(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_mid_network_window() {
        let config = ModelConfig {
            start_layer: "down3".to_string(),
            end_layer: "up3".to_string(),
            ..config(3)
        };
        let mut model = McdoModel::from_config(&config).unwrap();
        model.eval();

        let channels = StageName::Down3.input_channels(2, 3, config.reduction);
        let x = Tensor4::from_shape_fn((2, channels, 8, 8), |(b, c, r, w)| {
            ((b * 11 + c * 3 + r * 5 + w) % 13) as f32 / 13.0 - 0.4
        });
        let out = model.forward(&x).unwrap();

        let shape = StageName::Up3.output_shape(3, config.reduction, 32, 32);
        assert_eq!(out.logits.dim(), (2, shape.channels, shape.rows, shape.cols, 3));
        assert_eq!(out.logits.dim(), (2, 2, 8, 8, 3));
        assert_eq!(out.mean.dim(), (2, 2, 8, 8));
        assert!(out.variance.iter().all(|v| *v >= 0.0));
        for pixel in out.mean.lanes(Axis(1)) {
            assert_abs_diff_eq!(pixel.sum(), 1.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_backprop_logits_equal_pass_zero() {
        let mut model = McdoModel::from_config(&config(4)).unwrap();
        let out = model.forward(&input()).unwrap();
        let first = out.logits.index_axis(Axis(4), 0);
        assert_eq!(first, out.backprop.view());
        assert!(out.tape.is_some());
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let mut parallel = McdoModel::from_config(&config(6)).unwrap();
        let mut sequential = McdoModel::from_config(&config(6)).unwrap().with_parallel(false);
        let a = parallel.forward(&input()).unwrap();
        let b = sequential.forward(&input()).unwrap();
        assert_eq!(a.logits, b.logits);
        assert_eq!(a.mean, b.mean);
    }

    #[test]
    fn test_single_pass_eval_has_zero_uncertainty() {
        let mut model = McdoModel::from_config(&config(1)).unwrap();
        model.eval();
        let a = model.forward(&input()).unwrap();
        let b = model.forward(&input()).unwrap();
        assert_eq!(a.mean, b.mean);
        assert!(a.variance.iter().all(|v| *v == 0.0));
        assert!(a.mutual_information.iter().all(|v| v.abs() < 1e-5));
    }

    #[test]
    fn test_recalibration_after_aggregation_touches_mean_only() {
        let cfg = ModelConfig {
            recalibration_point: "afterMCDO".to_string(),
            ..config(3)
        };
        let mut plain = McdoModel::from_config(&config(3)).unwrap();
        let mut recal = McdoModel::from_config(&cfg).unwrap();
        recal.set_recalibration(Arc::new(Squash)).unwrap();

        let a = plain.forward(&input()).unwrap();
        let b = recal.forward(&input()).unwrap();
        assert_eq!(a.variance, b.variance);
        assert_abs_diff_eq!(
            b.mean[[0, 0, 3, 3]],
            a.mean[[0, 0, 3, 3]] * 0.5,
            epsilon = 1e-6
        );
        assert_abs_diff_eq!(b.mean[[0, 1, 3, 3]], a.mean[[0, 1, 3, 3]], epsilon = 1e-6);
    }

    #[test]
    fn test_recalibration_before_aggregation_renormalises() {
        let cfg = ModelConfig {
            recalibration_point: "beforeMCDO".to_string(),
            ..config(3)
        };
        let mut model = McdoModel::from_config(&cfg).unwrap();
        model.set_recalibration(Arc::new(Squash)).unwrap();
        let out = model.forward(&input()).unwrap();
        for pixel in out.mean.lanes(Axis(1)) {
            assert_abs_diff_eq!(pixel.sum(), 1.0, epsilon = 1e-5);
        }
        assert!(out.variance.iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn test_recalibrator_needs_a_point() {
        let mut model = McdoModel::from_config(&config(2)).unwrap();
        assert!(model.set_recalibration(Arc::new(Squash)).is_err());
    }
}
