//! Reliability curves and calibration error summaries.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::accumulator::BinTally;
use crate::bins::BinSet;

/// A point of the reliability diagram for one bin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityPoint {
    /// Mean predicted confidence, or the bin midpoint when the bin is empty
    pub predicted: f64,
    /// Empirical accuracy, zero when the bin is empty
    pub observed: f64,
    pub count: u64,
}

/// In-range reliability curve, one point per bin, in bin order.
pub fn reliability_curve(bins: &BinSet, tallies: &[BinTally]) -> Vec<ReliabilityPoint> {
    bins.iter()
        .zip(tallies)
        .map(|(bin, tally)| {
            if tally.num_in_range == 0 {
                ReliabilityPoint {
                    predicted: bin.midpoint(),
                    observed: 0.0,
                    count: 0,
                }
            } else {
                let n = tally.num_in_range as f64;
                ReliabilityPoint {
                    predicted: tally.sum_conf_in_range / n,
                    observed: tally.num_obs_in_range as f64 / n,
                    count: tally.num_in_range,
                }
            }
        })
        .collect()
}

/// Cumulative curve over every confidence below each bin's upper edge.
pub fn cumulative_curve(bins: &BinSet, tallies: &[BinTally]) -> Vec<ReliabilityPoint> {
    bins.iter()
        .zip(tallies)
        .map(|(bin, tally)| {
            let n = tally.num_below.max(1) as f64;
            ReliabilityPoint {
                predicted: if tally.num_below == 0 {
                    bin.midpoint()
                } else {
                    tally.sum_conf_below / n
                },
                observed: tally.num_obs_below as f64 / n,
                count: tally.num_below,
            }
        })
        .collect()
}

/// `(predicted, observed)` pairs sorted by ascending prediction, ready to fit.
pub fn fit_points(curve: &[ReliabilityPoint]) -> (Vec<f64>, Vec<f64>) {
    let empty = curve.iter().filter(|p| p.count == 0).count();
    if empty > 0 {
        warn!(empty, bins = curve.len(), "Empty calibration bins default to their midpoint");
    }
    let mut points: Vec<(f64, f64)> = curve.iter().map(|p| (p.predicted, p.observed)).collect();
    points.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));
    points.into_iter().unzip()
}

/// Statistics about a reliability curve
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationStats {
    /// Expected Calibration Error (lower is better)
    pub ece: f64,
    /// Maximum Calibration Error
    pub mce: f64,
    /// Number of predictions behind the curve
    pub sample_size: u64,
    pub reliability_bins: Vec<ReliabilityPoint>,
}

impl CalibrationStats {
    pub fn from_curve(curve: &[ReliabilityPoint]) -> Self {
        let n: u64 = curve.iter().map(|p| p.count).sum();
        let mut ece = 0.0;
        let mut mce: f64 = 0.0;

        for point in curve.iter().filter(|p| p.count > 0) {
            let calibration_error = (point.predicted - point.observed).abs();
            ece += calibration_error * point.count as f64 / n as f64;
            mce = mce.max(calibration_error);
        }

        Self {
            ece,
            mce,
            sample_size: n,
            reliability_bins: curve.to_vec(),
        }
    }
}
