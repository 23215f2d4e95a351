//! Per-model recalibration state: one overall and one per-class fit slot.

use ndarray::Axis;
use segmentation_core::{ClassRecalibration, RecalibratorKind, SegError, SegResult, Tensor4};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::accumulator::CalibrationAccumulator;
use crate::bins::BinSet;
use crate::calibrator::{CalibrationModel, Recalibrator};
use crate::stats::{fit_points, reliability_curve, CalibrationStats, ReliabilityPoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitState {
    Unfit,
    Fit,
}

/// A recalibration model that can be fitted exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitSlot {
    model: CalibrationModel,
    state: FitState,
    points: Vec<ReliabilityPoint>,
}

impl FitSlot {
    pub fn new(model: CalibrationModel) -> Self {
        Self {
            model,
            state: FitState::Unfit,
            points: Vec::new(),
        }
    }

    pub fn state(&self) -> FitState {
        self.state
    }

    pub fn is_fit(&self) -> bool {
        self.state == FitState::Fit
    }

    /// Reliability points the model was fitted on.
    pub fn points(&self) -> &[ReliabilityPoint] {
        &self.points
    }

    /// Fit on `curve` unless already fitted. Returns whether a fit happened.
    pub fn fit_once(&mut self, curve: &[ReliabilityPoint]) -> SegResult<bool> {
        if self.is_fit() {
            return Ok(false);
        }
        let (x, y) = fit_points(curve);
        self.model.fit(&x, &y)?;
        self.points = curve.to_vec();
        self.state = FitState::Fit;
        Ok(true)
    }

    /// Identity until fitted.
    pub fn predict(&self, confidence: f64) -> f64 {
        match self.state {
            FitState::Fit => self.model.predict(confidence),
            FitState::Unfit => confidence,
        }
    }
}

/// Overall and per-class recalibration of one segmentation model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecalibrationEngine {
    kind: RecalibratorKind,
    bins: BinSet,
    overall: FitSlot,
    per_class: Vec<FitSlot>,
}

impl RecalibrationEngine {
    pub fn new(kind: RecalibratorKind, bins: usize, n_classes: usize) -> SegResult<Self> {
        if n_classes == 0 {
            return Err(SegError::InvalidConfig("n_classes must be >= 1".to_string()));
        }
        let bins = BinSet::new(bins)?;
        let model = CalibrationModel::build(kind)?;
        Ok(Self {
            kind,
            bins,
            overall: FitSlot::new(model.clone()),
            per_class: vec![FitSlot::new(model); n_classes],
        })
    }

    pub fn kind(&self) -> RecalibratorKind {
        self.kind
    }

    pub fn bins(&self) -> &BinSet {
        &self.bins
    }

    /// Empty accumulator matching this engine's bins and classes.
    pub fn accumulator(&self) -> CalibrationAccumulator {
        CalibrationAccumulator::new(self.bins.clone(), self.per_class.len())
    }

    pub fn overall(&self) -> &FitSlot {
        &self.overall
    }

    pub fn class_slot(&self, class: usize) -> Option<&FitSlot> {
        self.per_class.get(class)
    }

    pub fn is_fit(&self) -> bool {
        self.overall.is_fit() && self.per_class.iter().all(FitSlot::is_fit)
    }

    /// Fit every unfitted slot from the accumulated tallies. Already fitted slots are
    /// left untouched.
    pub fn fit(&mut self, accumulator: &CalibrationAccumulator) -> SegResult<()> {
        if accumulator.bins() != &self.bins || accumulator.n_classes() != self.per_class.len() {
            return Err(SegError::ShapeMismatch {
                context: "fitting recalibration".to_string(),
                expected: vec![self.bins.len(), self.per_class.len()],
                actual: vec![accumulator.bins().len(), accumulator.n_classes()],
            });
        }

        let overall = reliability_curve(&self.bins, accumulator.overall());
        if self.overall.fit_once(&overall)? {
            let stats = CalibrationStats::from_curve(&overall);
            info!(
                model = self.overall.model.name(),
                ece = stats.ece,
                mce = stats.mce,
                samples = stats.sample_size,
                "Fitted overall recalibration"
            );
        }

        for (class, slot) in self.per_class.iter_mut().enumerate() {
            let tallies = accumulator.per_class(class).unwrap_or_default();
            let curve = reliability_curve(&self.bins, tallies);
            if slot.fit_once(&curve)? {
                debug!(class, "Fitted class recalibration");
            }
        }
        Ok(())
    }

    /// Recalibrate every class channel of `probs` in place.
    pub fn apply(&self, probs: &mut Tensor4) -> SegResult<()> {
        let n_classes = probs.len_of(Axis(1));
        if n_classes != self.per_class.len() {
            return Err(SegError::ShapeMismatch {
                context: "applying recalibration".to_string(),
                expected: vec![self.per_class.len()],
                actual: vec![n_classes],
            });
        }
        for (slot, mut channel) in self.per_class.iter().zip(probs.axis_iter_mut(Axis(1))) {
            channel.mapv_inplace(|v| slot.predict(f64::from(v)) as f32);
        }
        Ok(())
    }
}

impl ClassRecalibration for RecalibrationEngine {
    fn n_classes(&self) -> usize {
        self.per_class.len()
    }

    fn recalibrate(&self, class: usize, confidence: f32) -> f32 {
        match self.per_class.get(class) {
            Some(slot) => slot.predict(f64::from(confidence)) as f32,
            None => confidence,
        }
    }
}
