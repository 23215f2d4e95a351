//! Masked Stochastic Layer Stack.

use std::collections::HashMap;
use std::ops::Range;

use ndarray::{Array1, ArrayViewD, ArrayViewMutD};
use segmentation_core::{ModelConfig, RecalibratorKind, SegError, SegResult, StageName, Tensor4};
use tracing::{debug, info};

use crate::masks::MaskCache;
use crate::stage::{reference_stages, PoolIndices, StageTransform};

/// Seed used when the configuration does not carry one.
pub const DEFAULT_SEED: u64 = 1337;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

pub struct StageRecord {
    pub name: StageName,
    pub transform: Box<dyn StageTransform>,
    pub stochastic: bool,
}

/// Result of one forward pass through the stack.
#[derive(Debug, Clone)]
pub struct PassOutput {
    pub pass_index: usize,
    pub logits: Tensor4,
    /// Per-stage activations, recorded only for the tracked pass.
    pub tape: Option<Vec<(StageName, Tensor4)>>,
}

pub struct LayerStack {
    stages: Vec<StageRecord>,
    window: Range<usize>,
    masks: MaskCache,
    mode: Mode,
    mcdo_passes: usize,
    temperature: Array1<f32>,
    scale_logits: bool,
}

impl LayerStack {
    /// Reference SegNet stages initialised from the configured seed.
    pub fn from_config(config: &ModelConfig) -> SegResult<Self> {
        config.validate()?;
        let seed = config.seed.unwrap_or(DEFAULT_SEED);
        let stages = reference_stages(config.in_channels, config.n_classes, config.reduction, seed);
        Self::new(stages, config, seed)
    }

    /// Build a stack from externally supplied stages, listed in canonical order.
    /// The stages must cover the configured `[start_layer, end_layer]` window.
    pub fn new(
        stages: Vec<(StageName, Box<dyn StageTransform>)>,
        config: &ModelConfig,
        seed: u64,
    ) -> SegResult<Self> {
        let (start, end) = config.layer_window()?;

        if stages.windows(2).any(|w| w[0].0 >= w[1].0) {
            return Err(SegError::InvalidConfig(
                "stages must be listed in canonical order without repeats".to_string(),
            ));
        }
        let position = |name: StageName| {
            stages
                .iter()
                .position(|(n, _)| *n == name)
                .ok_or_else(|| SegError::UnknownStage(name.to_string()))
        };
        let window = position(start)?..position(end)? + 1;
        if window.len() != end.index() - start.index() + 1 {
            return Err(SegError::InvalidConfig(format!(
                "stages between {} and {} are missing",
                start, end
            )));
        }

        let in_window = |name: StageName| name >= start && name <= end;
        for (name, _) in &stages[window.clone()] {
            if let Some(mirror) = name.mirror() {
                if !in_window(mirror) {
                    return Err(SegError::MissingPoolIndices {
                        stage: name.to_string(),
                        mirror: mirror.to_string(),
                    });
                }
            }
        }
        for pair in stages[window.clone()].windows(2) {
            if pair[0].1.out_channels() != pair[1].1.in_channels() {
                return Err(SegError::ShapeMismatch {
                    context: format!("{} -> {}", pair[0].0, pair[1].0),
                    expected: vec![pair[0].1.out_channels()],
                    actual: vec![pair[1].1.in_channels()],
                });
            }
        }

        let shapes = stages[window.clone()]
            .iter()
            .filter(|(name, _)| name.is_stochastic())
            .map(|(name, transform)| {
                let mut shape = name.output_shape(
                    config.n_classes,
                    config.reduction,
                    config.img_rows,
                    config.img_cols,
                );
                shape.channels = transform.out_channels();
                (*name, shape)
            })
            .collect();
        let masks = MaskCache::new(config.dropout_p, config.batch_size, shapes, seed)?;

        let stages = stages
            .into_iter()
            .map(|(name, transform)| StageRecord {
                name,
                transform,
                stochastic: name.is_stochastic(),
            })
            .collect();

        info!(
            start = %start,
            end = %end,
            passes = config.mcdo_passes,
            dropout_p = config.dropout_p,
            "Built layer stack"
        );

        Ok(Self {
            stages,
            window,
            masks,
            mode: Mode::Train,
            mcdo_passes: config.mcdo_passes,
            temperature: Array1::ones(1),
            scale_logits: matches!(config.recalibrator_kind()?, RecalibratorKind::TemperatureScaling),
        })
    }

    pub fn train(&mut self) {
        self.mode = Mode::Train;
    }

    pub fn eval(&mut self) {
        self.mode = Mode::Eval;
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn mcdo_passes(&self) -> usize {
        self.mcdo_passes
    }

    /// Masks are applied while training or whenever more than one pass is requested.
    pub fn applies_masks(&self) -> bool {
        self.mode == Mode::Train || self.mcdo_passes > 1
    }

    pub fn window(&self) -> impl Iterator<Item = StageName> + '_ {
        self.stages[self.window.clone()].iter().map(|r| r.name)
    }

    pub fn masks(&self) -> &MaskCache {
        &self.masks
    }

    pub fn temperature(&self) -> f32 {
        self.temperature[0]
    }

    pub fn set_temperature(&mut self, temperature: f32) -> SegResult<()> {
        if !(temperature > 0.0) {
            return Err(SegError::InvalidConfig(format!(
                "temperature must be positive, got {}",
                temperature
            )));
        }
        self.temperature[0] = temperature;
        Ok(())
    }

    pub fn scales_logits(&self) -> bool {
        self.scale_logits
    }

    /// Start a new sweep: every cached mask is discarded.
    pub fn begin_sweep(&mut self) {
        self.masks.invalidate();
    }

    /// Make sure the masks of `pass_index` exist before a read-only pass runs.
    pub fn prepare_pass(&mut self, pass_index: usize) -> SegResult<()> {
        if self.applies_masks() {
            self.masks.ensure(pass_index)?;
        }
        Ok(())
    }

    /// One pass, lazily generating that pass's masks on first use.
    pub fn forward_once(&mut self, input: &Tensor4, pass_index: usize, track: bool) -> SegResult<PassOutput> {
        self.prepare_pass(pass_index)?;
        self.run_pass(input, pass_index, track)
    }

    /// One pass over previously prepared masks. Safe to call from several threads.
    pub fn run_pass(&self, input: &Tensor4, pass_index: usize, track: bool) -> SegResult<PassOutput> {
        let masked = self.applies_masks();
        let mut pools: HashMap<StageName, PoolIndices> = HashMap::new();
        let mut tape = if track { Some(Vec::with_capacity(self.window.len())) } else { None };
        let mut activation = input.clone();

        for record in &self.stages[self.window.clone()] {
            let pool = match record.name.mirror() {
                Some(mirror) => Some(pools.get(&mirror).ok_or_else(|| SegError::MissingPoolIndices {
                    stage: record.name.to_string(),
                    mirror: mirror.to_string(),
                })?),
                None => None,
            };
            let output = record.transform.forward(&activation, pool)?;
            activation = output.activation;
            if let Some(indices) = output.pool {
                pools.insert(record.name, indices);
            }

            if record.stochastic && masked {
                self.masks.apply(pass_index, record.name, &mut activation)?;
            }
            if let Some(tape) = tape.as_mut() {
                tape.push((record.name, activation.clone()));
            }
        }

        if self.scale_logits {
            let temperature = self.temperature[0];
            activation.mapv_inplace(|v| v / temperature);
        }

        debug!(pass_index, track, masked, "Completed forward pass");
        Ok(PassOutput {
            pass_index,
            logits: activation,
            tape,
        })
    }

    /// Every learnable tensor, keyed `"{stage}.{parameter}"`, plus `temperature`.
    pub fn named_parameters(&self) -> Vec<(String, ArrayViewD<'_, f32>)> {
        let mut params: Vec<(String, ArrayViewD<'_, f32>)> = self
            .stages
            .iter()
            .flat_map(|record| {
                record
                    .transform
                    .parameters()
                    .into_iter()
                    .map(move |(local, view)| (format!("{}.{}", record.name, local), view))
            })
            .collect();
        params.push(("temperature".to_string(), self.temperature.view().into_dyn()));
        params
    }

    pub fn named_parameters_mut(&mut self) -> Vec<(String, ArrayViewMutD<'_, f32>)> {
        let mut params: Vec<(String, ArrayViewMutD<'_, f32>)> = self
            .stages
            .iter_mut()
            .flat_map(|record| {
                let name = record.name;
                record
                    .transform
                    .parameters_mut()
                    .into_iter()
                    .map(move |(local, view)| (format!("{}.{}", name, local), view))
            })
            .collect();
        params.push(("temperature".to_string(), self.temperature.view_mut().into_dyn()));
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> ModelConfig {
        ModelConfig {
            n_classes: 3,
            in_channels: 2,
            batch_size: 2,
            img_rows: 32,
            img_cols: 32,
            reduction: 1.0 / 64.0,
            mcdo_passes: 4,
            dropout_p: 0.5,
            seed: Some(5),
            ..Default::default()
        }
    }

    fn input(config: &ModelConfig) -> Tensor4 {
        Tensor4::from_shape_fn(
            (config.batch_size, config.in_channels, config.img_rows, config.img_cols),
            |(b, c, r, w)| ((b * 7 + c * 3 + r * 5 + w) % 11) as f32 / 11.0,
        )
    }

    #[test]
    fn test_single_pass_eval_is_deterministic() {
        let config = ModelConfig {
            mcdo_passes: 1,
            ..small_config()
        };
        let mut stack = LayerStack::from_config(&config).unwrap();
        stack.eval();
        assert!(!stack.applies_masks());

        let x = input(&config);
        let a = stack.forward_once(&x, 0, false).unwrap();
        stack.begin_sweep();
        let b = stack.forward_once(&x, 0, false).unwrap();
        assert_eq!(a.logits, b.logits);
        assert_eq!(a.logits.dim(), (2, 3, 32, 32));
    }

    #[test]
    fn test_masks_apply_when_training_single_pass() {
        let config = ModelConfig {
            mcdo_passes: 1,
            ..small_config()
        };
        let mut stack = LayerStack::from_config(&config).unwrap();
        assert_eq!(stack.mode(), Mode::Train);
        assert!(stack.applies_masks());
        stack.forward_once(&input(&config), 0, false).unwrap();
        assert!(stack.masks().contains(0));
    }

    #[test]
    fn test_pass_reuses_frozen_masks() {
        let config = small_config();
        let mut stack = LayerStack::from_config(&config).unwrap();
        stack.eval();
        let x = input(&config);
        let first = stack.forward_once(&x, 2, false).unwrap();
        let again = stack.forward_once(&x, 2, false).unwrap();
        assert_eq!(first.logits, again.logits);
    }

    #[test]
    fn test_identical_stacks_share_masks() {
        let config = small_config();
        let mut a = LayerStack::from_config(&config).unwrap();
        let mut b = LayerStack::from_config(&config).unwrap();
        a.prepare_pass(1).unwrap();
        b.prepare_pass(1).unwrap();
        for stage in [StageName::Down3, StageName::Down5, StageName::Up3] {
            assert_eq!(a.masks().get(1, stage), b.masks().get(1, stage));
        }
    }

    #[test]
    fn test_run_pass_requires_prepared_masks() {
        let config = small_config();
        let stack = LayerStack::from_config(&config).unwrap();
        assert!(matches!(
            stack.run_pass(&input(&config), 0, false),
            Err(SegError::MaskNotGenerated { .. })
        ));
    }

    #[test]
    fn test_batch_size_change_is_rejected() {
        let config = small_config();
        let mut stack = LayerStack::from_config(&config).unwrap();
        let x = Tensor4::ones((3, 2, 32, 32));
        assert!(matches!(
            stack.forward_once(&x, 0, false),
            Err(SegError::BatchSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_tracked_pass_records_window() {
        let config = small_config();
        let mut stack = LayerStack::from_config(&config).unwrap();
        let tracked = stack.forward_once(&input(&config), 0, true).unwrap();
        let tape = tracked.tape.unwrap();
        assert_eq!(tape.len(), 10);
        assert_eq!(tape[0].0, StageName::Down1);
        assert_eq!(tape[9].1, tracked.logits);

        let untracked = stack.forward_once(&input(&config), 1, false).unwrap();
        assert!(untracked.tape.is_none());
    }

    #[test]
    fn test_encoder_only_window() {
        let config = ModelConfig {
            end_layer: "down3".to_string(),
            ..small_config()
        };
        let mut stack = LayerStack::from_config(&config).unwrap();
        let out = stack.forward_once(&input(&config), 0, false).unwrap();
        assert_eq!(out.logits.dim(), (2, 4, 4, 4));
        assert_eq!(stack.window().count(), 3);
    }

    #[test]
    fn test_decoder_without_mirror_is_rejected() {
        let config = ModelConfig {
            start_layer: "down3".to_string(),
            end_layer: "up3".to_string(),
            ..small_config()
        };
        assert!(LayerStack::from_config(&config).is_ok());

        let config = ModelConfig {
            start_layer: "down5".to_string(),
            end_layer: "up4".to_string(),
            ..small_config()
        };
        assert!(matches!(
            LayerStack::from_config(&config),
            Err(SegError::MissingPoolIndices { .. })
        ));
    }

    #[test]
    fn test_temperature_divides_logits() {
        let base = ModelConfig {
            mcdo_passes: 1,
            ..small_config()
        };
        let scaled_config = ModelConfig {
            recalibrator: "temperature_scaling".to_string(),
            ..base.clone()
        };
        let mut plain = LayerStack::from_config(&base).unwrap();
        let mut scaled = LayerStack::from_config(&scaled_config).unwrap();
        plain.eval();
        scaled.eval();
        scaled.set_temperature(2.0).unwrap();
        assert!(scaled.set_temperature(0.0).is_err());

        let x = input(&base);
        let a = plain.forward_once(&x, 0, false).unwrap().logits;
        let b = scaled.forward_once(&x, 0, false).unwrap().logits;
        for (lhs, rhs) in a.iter().zip(b.iter()) {
            approx::assert_abs_diff_eq!(lhs / 2.0, *rhs, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_named_parameters_cover_all_stages() {
        let config = small_config();
        let mut stack = LayerStack::from_config(&config).unwrap();
        let names: Vec<String> = stack.named_parameters().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names.len(), 21);
        assert!(names.contains(&"down1.weight".to_string()));
        assert!(names.contains(&"up1.bias".to_string()));
        assert_eq!(names.last().map(String::as_str), Some("temperature"));

        for (name, mut view) in stack.named_parameters_mut() {
            if name == "temperature" {
                view.fill(3.0);
            }
        }
        assert_eq!(stack.temperature(), 3.0);
    }
}
