//! Reliability-diagram artifacts written as JSON documents under
//! `{logdir}/calibration/{model}/`.

use std::fs;
use std::path::{Path, PathBuf};

use segmentation_core::SegResult;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::accumulator::CalibrationAccumulator;
use crate::engine::{FitSlot, RecalibrationEngine};
use crate::stats::{cumulative_curve, reliability_curve, CalibrationStats, ReliabilityPoint};

/// Sampling step of the recalibration curve over `[0, 1)`.
pub const CURVE_STEP: f64 = 0.001;

/// `(observed, recalibrated prediction)` for one reliability point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecalibratedPoint {
    pub observed: f64,
    pub recalibrated: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagramPanel {
    pub observed: Vec<ReliabilityPoint>,
    pub cumulative: Vec<ReliabilityPoint>,
    pub recalibrated: Vec<RecalibratedPoint>,
    /// `(raw, calibrated)` pairs
    pub curve: Vec<(f64, f64)>,
    pub stats: CalibrationStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassPanel {
    pub class: usize,
    pub panel: DiagramPanel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DiagramDocument<T> {
    model: String,
    iteration: usize,
    recalibrator: String,
    content: T,
}

impl<T> DiagramDocument<T> {
    fn new(model: &str, iteration: usize, recalibrator: &str, content: T) -> Self {
        Self {
            model: model.to_string(),
            iteration,
            recalibrator: recalibrator.to_string(),
            content,
        }
    }
}

fn sample_curve(slot: &FitSlot) -> Vec<(f64, f64)> {
    let steps = (1.0 / CURVE_STEP).round() as usize;
    (0..steps)
        .map(|k| {
            let x = k as f64 * CURVE_STEP;
            (x, slot.predict(x))
        })
        .collect()
}

fn panel(
    slot: &FitSlot,
    observed: Vec<ReliabilityPoint>,
    cumulative: Vec<ReliabilityPoint>,
) -> DiagramPanel {
    let recalibrated = observed
        .iter()
        .map(|p| RecalibratedPoint {
            observed: p.observed,
            recalibrated: slot.predict(p.predicted),
        })
        .collect();
    DiagramPanel {
        stats: CalibrationStats::from_curve(&observed),
        curve: sample_curve(slot),
        observed,
        cumulative,
        recalibrated,
    }
}

fn write_document<T: Serialize>(path: &Path, document: &DiagramDocument<T>) -> SegResult<()> {
    fs::write(path, serde_json::to_vec_pretty(document)?)?;
    Ok(())
}

/// Write `calibratedOverall{i}.json`, `uncalibratedPerClass{i}.json` and
/// `calibratedPerClass{i}.json` for one model. Returns the written paths.
pub fn write_reliability_diagrams(
    logdir: &Path,
    model: &str,
    iteration: usize,
    engine: &RecalibrationEngine,
    accumulator: &CalibrationAccumulator,
) -> SegResult<Vec<PathBuf>> {
    let dir = logdir.join("calibration").join(model);
    fs::create_dir_all(&dir)?;
    let bins = accumulator.bins();

    let overall = panel(
        engine.overall(),
        reliability_curve(bins, accumulator.overall()),
        cumulative_curve(bins, accumulator.overall()),
    );

    let mut uncalibrated = Vec::with_capacity(accumulator.n_classes());
    let mut calibrated = Vec::with_capacity(accumulator.n_classes());
    for class in 0..accumulator.n_classes() {
        let (Some(slot), Some(tallies)) = (engine.class_slot(class), accumulator.per_class(class)) else {
            continue;
        };
        let observed = reliability_curve(bins, tallies);
        let cumulative = cumulative_curve(bins, tallies);
        uncalibrated.push(ClassPanel {
            class,
            panel: DiagramPanel {
                stats: CalibrationStats::from_curve(&observed),
                observed: observed.clone(),
                cumulative: cumulative.clone(),
                recalibrated: Vec::new(),
                curve: Vec::new(),
            },
        });
        calibrated.push(ClassPanel {
            class,
            panel: panel(slot, observed, cumulative),
        });
    }

    let paths = vec![
        dir.join(format!("calibratedOverall{}.json", iteration)),
        dir.join(format!("uncalibratedPerClass{}.json", iteration)),
        dir.join(format!("calibratedPerClass{}.json", iteration)),
    ];
    let recalibrator = engine.kind().to_string();
    write_document(&paths[0], &DiagramDocument::new(model, iteration, &recalibrator, overall))?;
    write_document(&paths[1], &DiagramDocument::new(model, iteration, &recalibrator, uncalibrated))?;
    write_document(&paths[2], &DiagramDocument::new(model, iteration, &recalibrator, calibrated))?;

    info!(model, iteration, dir = %dir.display(), "Wrote reliability diagrams");
    Ok(paths)
}
