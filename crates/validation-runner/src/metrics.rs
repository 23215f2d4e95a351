use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ndarray::{Array2, Axis};
use segmentation_core::LabelMap;
use serde::{Deserialize, Serialize};

/// Confusion-matrix segmentation score accumulated over a validation run.
/// Rows are ground truth, columns predictions. Out-of-range labels are ignored.
#[derive(Debug, Clone)]
pub struct RunningScore {
    n_classes: usize,
    confusion: Array2<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scores {
    pub overall_acc: f64,
    pub mean_acc: f64,
    pub freq_weighted_acc: f64,
    pub mean_iou: f64,
    pub class_iou: Vec<Option<f64>>,
}

impl RunningScore {
    pub fn new(n_classes: usize) -> Self {
        Self {
            n_classes,
            confusion: Array2::zeros((n_classes, n_classes)),
        }
    }

    pub fn update(&mut self, truth: &LabelMap, prediction: &LabelMap) {
        for (&t, &p) in truth.iter().zip(prediction.iter()) {
            if t < self.n_classes && p < self.n_classes {
                self.confusion[[t, p]] += 1;
            }
        }
    }

    pub fn total(&self) -> u64 {
        self.confusion.sum()
    }

    /// Classes absent from both truth and prediction have no IoU and are left out of
    /// the means.
    pub fn scores(&self) -> Scores {
        let diag: Vec<f64> = self.confusion.diag().iter().map(|&v| v as f64).collect();
        let truth: Vec<f64> = self.confusion.sum_axis(Axis(1)).iter().map(|&v| v as f64).collect();
        let predicted: Vec<f64> = self.confusion.sum_axis(Axis(0)).iter().map(|&v| v as f64).collect();
        let total = self.total() as f64;

        let class_acc: Vec<Option<f64>> = diag
            .iter()
            .zip(&truth)
            .map(|(&d, &t)| (t > 0.0).then(|| d / t))
            .collect();
        let class_iou: Vec<Option<f64>> = (0..self.n_classes)
            .map(|k| {
                let union = truth[k] + predicted[k] - diag[k];
                (union > 0.0).then(|| diag[k] / union)
            })
            .collect();

        let freq_weighted_acc = if total > 0.0 {
            class_iou
                .iter()
                .zip(&truth)
                .filter_map(|(iou, &t)| iou.map(|iou| iou * t / total))
                .sum()
        } else {
            0.0
        };

        Scores {
            overall_acc: if total > 0.0 { diag.iter().sum::<f64>() / total } else { 0.0 },
            mean_acc: nan_mean(&class_acc),
            freq_weighted_acc,
            mean_iou: nan_mean(&class_iou),
            class_iou,
        }
    }

    pub fn reset(&mut self) {
        self.confusion.fill(0);
    }
}

fn nan_mean(values: &[Option<f64>]) -> f64 {
    let present: Vec<f64> = values.iter().flatten().copied().collect();
    if present.is_empty() {
        0.0
    } else {
        present.iter().sum::<f64>() / present.len() as f64
    }
}

/// Running average of a scalar.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AverageMeter {
    pub val: f64,
    pub sum: f64,
    pub count: u64,
    pub avg: f64,
}

impl AverageMeter {
    pub fn update(&mut self, val: f64) {
        self.val = val;
        self.sum += val;
        self.count += 1;
        self.avg = self.sum / self.count as f64;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Per-modality meters for one validation run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModalityMeters {
    pub loss: AverageMeter,
    pub variance: AverageMeter,
    pub entropy: AverageMeter,
    pub mutual_information: AverageMeter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModalityMetrics {
    pub loss: f64,
    pub variance: f64,
    pub entropy: f64,
    pub mutual_information: f64,
    /// Expected calibration error of the uncalibrated overall curve
    pub ece: Option<f64>,
}

impl ModalityMeters {
    pub fn summary(&self, ece: Option<f64>) -> ModalityMetrics {
        ModalityMetrics {
            loss: self.loss.avg,
            variance: self.variance.avg,
            entropy: self.entropy.avg,
            mutual_information: self.mutual_information.avg,
            ece,
        }
    }
}

/// One line of `metrics.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub timestamp: DateTime<Utc>,
    pub iteration: usize,
    pub fusion: String,
    pub scores: Scores,
    pub modalities: BTreeMap<String, ModalityMetrics>,
}

/// Appends validation records as JSON lines under the run's log directory.
pub struct MetricsSink {
    path: PathBuf,
    file: File,
}

impl MetricsSink {
    pub fn open(logdir: &Path) -> Result<Self> {
        fs::create_dir_all(logdir)
            .with_context(|| format!("Failed to create log directory {}", logdir.display()))?;
        let path = logdir.join("metrics.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&mut self, record: &MetricsRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        writeln!(self.file, "{}", line)
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        Ok(())
    }
}
