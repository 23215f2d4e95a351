use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use confidence_calibrator::{
    fit_temperature, reliability_curve, write_reliability_diagrams, CalibrationAccumulator,
    CalibrationStats, RecalibrationEngine,
};
use mcdo_engine::{cross_entropy, load_pretrained, Checkpoint, McdoModel};
use ndarray::{concatenate, Axis};
use segmentation_core::{
    FusionStrategy, LabelMap, Modality, RecalibrationPoint, RecalibratorKind, Tensor4,
};
use sensor_fusion::{reduce_variance, ScalingModule};
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::data::BatchSource;
use crate::metrics::{MetricsRecord, MetricsSink, ModalityMeters, ModalityMetrics, RunningScore, Scores};

const ARCH: &str = "segnet_mcdo";

pub fn best_model_path(logdir: &Path, modality: &Modality) -> PathBuf {
    logdir
        .join("best_model")
        .join(format!("{}_{}_best_model.json", modality, ARCH))
}

pub fn periodic_model_path(logdir: &Path, modality: &Modality, iteration: usize) -> PathBuf {
    logdir.join(format!("{}_{}_{}_model.json", modality, ARCH, iteration))
}

/// One modality's MCDO model and its recalibration state.
pub struct ModalityPipeline {
    pub modality: Modality,
    pub model: McdoModel,
    pub engine: Option<RecalibrationEngine>,
    /// ECE of the uncalibrated overall curve, once fitted
    pub ece: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub iteration: usize,
    pub scores: Scores,
    pub modalities: BTreeMap<String, ModalityMetrics>,
    pub improved: bool,
}

/// Drives validation epochs: MCDO inference per modality, recalibration, fusion,
/// metrics and checkpoints.
pub struct Validator {
    config: RunConfig,
    pipelines: Vec<ModalityPipeline>,
    fusion: Box<dyn FusionStrategy>,
    scaling: ScalingModule,
    recalibrator: RecalibratorKind,
    score: RunningScore,
    sink: MetricsSink,
    best_iou: f64,
    start_iteration: usize,
    calibrated: bool,
}

impl Validator {
    pub fn new(mut config: RunConfig) -> Result<Self> {
        config.validate()?;
        let seed = config.resolve_seed();
        let recalibrator = config.model.recalibrator_kind()?;
        let fusion = sensor_fusion::build(config.model.fusion_kind()?);
        let scaling = ScalingModule::from_kind(config.model.scaling_kind()?);

        let mut best_iou = f64::NEG_INFINITY;
        let mut start_iteration = 0;
        let mut pipelines = Vec::with_capacity(config.modalities.len());

        for (index, entry) in config.modalities.iter().enumerate() {
            let modality = entry.modality();
            let mut model = McdoModel::from_config(&config.model)
                .with_context(|| format!("Failed to build model for modality {}", modality))?;
            model.eval();

            let path = match &config.resume {
                Some(dir) => Some(dir.join(format!("{}_{}_best_model.json", modality, ARCH))),
                None => entry.checkpoint.clone(),
            };
            let required = index == 0 && path.is_some();
            let loaded = load_pretrained(model.stack_mut(), path.as_deref(), required)
                .with_context(|| format!("Failed to load weights for modality {}", modality))?;
            if let Some(checkpoint) = loaded {
                if config.resume.is_some() {
                    start_iteration = start_iteration.max(checkpoint.epoch);
                    best_iou = best_iou.max(checkpoint.mean_iou);
                }
            }

            let engine = if recalibrator.is_binned() {
                Some(RecalibrationEngine::new(
                    recalibrator,
                    config.model.bins,
                    config.model.n_classes,
                )?)
            } else {
                None
            };

            info!(
                modality = %modality,
                passes = model.passes(),
                point = ?model.recalibration_point(),
                "Model ready"
            );
            pipelines.push(ModalityPipeline {
                modality,
                model,
                engine,
                ece: None,
            });
        }

        let sink = MetricsSink::open(&config.logdir)?;
        info!(
            seed,
            fusion = fusion.name(),
            scaling = scaling.name(),
            recalibrator = %recalibrator,
            metrics = %sink.path().display(),
            "Validator initialised"
        );

        Ok(Self {
            score: RunningScore::new(config.model.n_classes),
            config,
            pipelines,
            fusion,
            scaling,
            recalibrator,
            sink,
            best_iou,
            start_iteration,
            calibrated: false,
        })
    }

    pub fn pipeline(&self, modality: &Modality) -> Option<&ModalityPipeline> {
        self.pipelines.iter().find(|p| &p.modality == modality)
    }

    pub fn best_iou(&self) -> f64 {
        self.best_iou
    }

    pub fn start_iteration(&self) -> usize {
        self.start_iteration
    }

    /// Run every remaining iteration, validating every `val_interval`.
    pub fn run(&mut self, source: &dyn BatchSource) -> Result<Vec<ValidationReport>> {
        let mut reports = Vec::new();
        for iteration in self.start_iteration + 1..=self.config.iterations {
            if iteration % self.config.val_interval != 0 {
                continue;
            }
            let report = self.validate(iteration, source)?;
            self.save_checkpoints(&report)?;
            reports.push(report);
        }
        Ok(reports)
    }

    fn needs_calibration(&self) -> bool {
        !self.calibrated
            && (self.recalibrator.is_binned() || self.recalibrator == RecalibratorKind::TemperatureScaling)
    }

    /// Accumulate reliability statistics over the whole source and fit every model's
    /// recalibration once.
    fn calibrate(&mut self, iteration: usize, source: &dyn BatchSource) -> Result<()> {
        let temperature = self.recalibrator == RecalibratorKind::TemperatureScaling;
        let mut accumulators: Vec<Option<CalibrationAccumulator>> = self
            .pipelines
            .iter()
            .map(|p| p.engine.as_ref().map(RecalibrationEngine::accumulator))
            .collect();
        let mut logits: Vec<Vec<Tensor4>> = vec![Vec::new(); self.pipelines.len()];
        let mut labels: Vec<LabelMap> = Vec::new();

        for index in 0..source.len() {
            let batch = source.batch(index)?;
            for (i, pipeline) in self.pipelines.iter_mut().enumerate() {
                let input = batch
                    .inputs
                    .get(&pipeline.modality)
                    .with_context(|| format!("Batch {} has no {} input", index, pipeline.modality))?;
                let output = pipeline.model.forward(input)?;
                if let Some(acc) = accumulators[i].as_mut() {
                    acc.accumulate(&output.mean, &batch.labels)?;
                }
                if temperature {
                    logits[i].push(output.backprop);
                }
            }
            if temperature {
                labels.push(batch.labels);
            }
        }

        for (i, pipeline) in self.pipelines.iter_mut().enumerate() {
            if let (Some(engine), Some(acc)) = (pipeline.engine.as_mut(), accumulators[i].as_ref()) {
                engine.fit(acc)?;
                let stats = CalibrationStats::from_curve(&reliability_curve(acc.bins(), acc.overall()));
                pipeline.ece = Some(stats.ece);
                write_reliability_diagrams(
                    &self.config.logdir,
                    pipeline.modality.as_str(),
                    iteration,
                    engine,
                    acc,
                )?;

                if pipeline.model.recalibration_point() == RecalibrationPoint::None {
                    warn!(
                        modality = %pipeline.modality,
                        "Recalibrator fitted but recalibration_point is None, leaving outputs uncalibrated"
                    );
                } else {
                    pipeline.model.set_recalibration(Arc::new(engine.clone()))?;
                }
            }

            if temperature && !logits[i].is_empty() {
                let views: Vec<_> = logits[i].iter().map(|l| l.view()).collect();
                let stacked = concatenate(Axis(0), &views)?;
                let label_views: Vec<_> = labels.iter().map(|l| l.view()).collect();
                let stacked_labels = concatenate(Axis(0), &label_views)?;

                let factor = fit_temperature(&stacked, &stacked_labels)?;
                let stack = pipeline.model.stack_mut();
                let temperature = stack.temperature() * factor;
                stack.set_temperature(temperature)?;
                info!(modality = %pipeline.modality, temperature, "Fitted temperature");
            }
        }

        self.calibrated = true;
        Ok(())
    }

    /// One validation epoch over `source`.
    pub fn validate(&mut self, iteration: usize, source: &dyn BatchSource) -> Result<ValidationReport> {
        if self.needs_calibration() {
            self.calibrate(iteration, source)?;
        }

        info!(iteration, batches = source.len(), "Validating");
        self.score.reset();
        let mut meters = vec![ModalityMeters::default(); self.pipelines.len()];

        for index in 0..source.len() {
            let batch = source.batch(index)?;
            let mut means = BTreeMap::new();
            let mut variances = BTreeMap::new();

            for (pipeline, meter) in self.pipelines.iter_mut().zip(meters.iter_mut()) {
                let input = batch
                    .inputs
                    .get(&pipeline.modality)
                    .with_context(|| format!("Batch {} has no {} input", index, pipeline.modality))?;
                let mut output = pipeline.model.forward(input)?;

                let loss = cross_entropy(&output.backprop, &batch.labels, None)?;
                meter.loss.update(f64::from(loss));
                meter.variance.update(f64::from(output.variance.mean().unwrap_or(0.0)));
                meter.entropy.update(f64::from(output.entropy.mean().unwrap_or(0.0)));
                meter
                    .mutual_information
                    .update(f64::from(output.mutual_information.mean().unwrap_or(0.0)));

                debug!(
                    modality = %pipeline.modality,
                    batch = index,
                    entropy = meter.entropy.val,
                    mutual_information = meter.mutual_information.val,
                    "Batch uncertainty"
                );

                self.scaling
                    .apply(&mut output.mean, &output.entropy, &output.mutual_information)?;
                variances.insert(pipeline.modality.clone(), reduce_variance(&output.variance));
                means.insert(pipeline.modality.clone(), output.mean);
            }

            let fused = self.fusion.fuse(&means, &variances)?;
            self.score.update(&batch.labels, &argmax_classes(&fused));
        }

        let scores = self.score.scores();
        let improved = scores.mean_iou > self.best_iou;
        if improved {
            self.best_iou = scores.mean_iou;
        }

        let modalities: BTreeMap<String, ModalityMetrics> = self
            .pipelines
            .iter()
            .zip(&meters)
            .map(|(p, m)| (p.modality.to_string(), m.summary(p.ece)))
            .collect();

        for (name, metrics) in &modalities {
            info!(
                modality = %name,
                iteration,
                loss = metrics.loss,
                variance = metrics.variance,
                entropy = metrics.entropy,
                mutual_information = metrics.mutual_information,
                "Validation loss"
            );
        }
        info!(
            iteration,
            overall_acc = scores.overall_acc,
            mean_acc = scores.mean_acc,
            freq_weighted_acc = scores.freq_weighted_acc,
            mean_iou = scores.mean_iou,
            best_iou = self.best_iou,
            "Validation scores"
        );

        self.sink.write(&MetricsRecord {
            timestamp: chrono::Utc::now(),
            iteration,
            fusion: self.fusion.name().to_string(),
            scores: scores.clone(),
            modalities: modalities.clone(),
        })?;

        Ok(ValidationReport {
            iteration,
            scores,
            modalities,
            improved,
        })
    }

    fn save_checkpoints(&self, report: &ValidationReport) -> Result<()> {
        let logdir = &self.config.logdir;
        let periodic = self.config.save_interval > 0 && report.iteration % self.config.save_interval == 0;
        if !report.improved && !periodic {
            return Ok(());
        }

        for pipeline in &self.pipelines {
            let checkpoint = Checkpoint::capture(
                pipeline.model.stack(),
                report.iteration,
                report.scores.mean_iou,
            );
            if report.improved {
                info!(modality = %pipeline.modality, mean_iou = report.scores.mean_iou, "Saving best model");
                checkpoint.save(best_model_path(logdir, &pipeline.modality))?;
            }
            if periodic {
                checkpoint.save(periodic_model_path(logdir, &pipeline.modality, report.iteration))?;
            }
        }
        Ok(())
    }
}

/// Arg-max over the class axis.
pub fn argmax_classes(scores: &Tensor4) -> LabelMap {
    scores.map_axis(Axis(1), |lane| {
        lane.iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (k, &v)| if v > best.1 { (k, v) } else { best })
            .0
    })
}
