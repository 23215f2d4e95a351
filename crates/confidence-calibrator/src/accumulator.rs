//! Running reliability tallies collected over validation batches.

use ndarray::Axis;
use segmentation_core::{LabelMap, SegError, SegResult, Tensor4};
use serde::{Deserialize, Serialize};

use crate::bins::BinSet;

/// Tallies of one confidence bin. Never decremented.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BinTally {
    /// Sum of confidences falling inside the bin
    pub sum_conf_in_range: f64,
    /// Correct predictions inside the bin
    pub num_obs_in_range: u64,
    pub num_in_range: u64,
    /// Same tallies over every confidence below the bin's upper edge
    pub sum_conf_below: f64,
    pub num_obs_below: u64,
    pub num_below: u64,
    pub num_correct: u64,
}

impl BinTally {
    fn merge(&mut self, other: &BinTally) {
        self.sum_conf_in_range += other.sum_conf_in_range;
        self.num_obs_in_range += other.num_obs_in_range;
        self.num_in_range += other.num_in_range;
        self.sum_conf_below += other.sum_conf_below;
        self.num_obs_below += other.num_obs_below;
        self.num_below += other.num_below;
        self.num_correct += other.num_correct;
    }
}

fn record(tallies: &mut [BinTally], bin: usize, confidence: f64, correct: bool) {
    let hit = u64::from(correct);
    let in_range = &mut tallies[bin];
    in_range.sum_conf_in_range += confidence;
    in_range.num_obs_in_range += hit;
    in_range.num_in_range += 1;
    // Every bin whose upper edge lies above the confidence.
    for below in tallies[bin..].iter_mut() {
        below.sum_conf_below += confidence;
        below.num_obs_below += hit;
        below.num_below += 1;
    }
}

/// Overall (arg-max) and per-class tallies for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationAccumulator {
    bins: BinSet,
    n_classes: usize,
    overall: Vec<BinTally>,
    per_class: Vec<Vec<BinTally>>,
    pixels: u64,
}

impl CalibrationAccumulator {
    pub fn new(bins: BinSet, n_classes: usize) -> Self {
        let n = bins.len();
        Self {
            bins,
            n_classes,
            overall: vec![BinTally::default(); n],
            per_class: vec![vec![BinTally::default(); n]; n_classes],
            pixels: 0,
        }
    }

    pub fn bins(&self) -> &BinSet {
        &self.bins
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    pub fn overall(&self) -> &[BinTally] {
        &self.overall
    }

    pub fn per_class(&self, class: usize) -> Option<&[BinTally]> {
        self.per_class.get(class).map(Vec::as_slice)
    }

    /// Labelled pixels seen so far.
    pub fn pixels(&self) -> u64 {
        self.pixels
    }

    /// Add one batch of ensemble means `(batch, class, rows, cols)` against its labels.
    ///
    /// Overall tallies use the arg-max class and its probability. Per-class tallies use
    /// each channel's own probability, counting a hit where the label equals that class.
    /// Pixels labelled outside `0..n_classes` are skipped.
    pub fn accumulate(&mut self, mean: &Tensor4, labels: &LabelMap) -> SegResult<()> {
        let (batch, n_classes, rows, cols) = mean.dim();
        if n_classes != self.n_classes {
            return Err(SegError::ShapeMismatch {
                context: "calibration accumulator classes".to_string(),
                expected: vec![batch, self.n_classes, rows, cols],
                actual: mean.shape().to_vec(),
            });
        }
        if labels.dim() != (batch, rows, cols) {
            return Err(SegError::ShapeMismatch {
                context: "calibration accumulator labels".to_string(),
                expected: vec![batch, rows, cols],
                actual: labels.shape().to_vec(),
            });
        }

        for (b, sample) in mean.axis_iter(Axis(0)).enumerate() {
            for r in 0..rows {
                for c in 0..cols {
                    let truth = labels[[b, r, c]];
                    if truth >= n_classes {
                        continue;
                    }
                    self.pixels += 1;

                    let pixel = sample.slice(ndarray::s![.., r, c]);
                    let (argmax, top) = pixel
                        .iter()
                        .enumerate()
                        .fold((0, f32::NEG_INFINITY), |best, (k, &p)| if p > best.1 { (k, p) } else { best });

                    for tally in self.overall.iter_mut() {
                        tally.num_correct += u64::from(argmax == truth);
                    }
                    if let Some(bin) = self.bins.index_of(f64::from(top)) {
                        record(&mut self.overall, bin, f64::from(top), argmax == truth);
                    }

                    for (class, &p) in pixel.iter().enumerate() {
                        let tallies = &mut self.per_class[class];
                        for tally in tallies.iter_mut() {
                            tally.num_correct += u64::from(class == truth);
                        }
                        if let Some(bin) = self.bins.index_of(f64::from(p)) {
                            record(tallies, bin, f64::from(p), class == truth);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Fold another accumulator built over the same bins and classes into this one.
    pub fn merge(&mut self, other: &CalibrationAccumulator) -> SegResult<()> {
        if self.bins != other.bins || self.n_classes != other.n_classes {
            return Err(SegError::ShapeMismatch {
                context: "merging calibration accumulators".to_string(),
                expected: vec![self.bins.len(), self.n_classes],
                actual: vec![other.bins.len(), other.n_classes],
            });
        }
        for (mine, theirs) in self.overall.iter_mut().zip(&other.overall) {
            mine.merge(theirs);
        }
        for (mine, theirs) in self.per_class.iter_mut().zip(&other.per_class) {
            for (a, b) in mine.iter_mut().zip(theirs) {
                a.merge(b);
            }
        }
        self.pixels += other.pixels;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array3;

    fn batch() -> (Tensor4, LabelMap) {
        // Two pixels, two classes.
        let mut mean = Tensor4::zeros((1, 2, 1, 2));
        mean[[0, 0, 0, 0]] = 0.9;
        mean[[0, 1, 0, 0]] = 0.1;
        mean[[0, 0, 0, 1]] = 0.3;
        mean[[0, 1, 0, 1]] = 0.7;
        let mut labels = Array3::zeros((1, 1, 2));
        labels[[0, 0, 1]] = 0;
        (mean, labels)
    }

    #[test]
    fn test_overall_tallies_use_argmax() {
        let (mean, labels) = batch();
        let mut acc = CalibrationAccumulator::new(BinSet::new(4).unwrap(), 2);
        acc.accumulate(&mean, &labels).unwrap();

        let overall = acc.overall();
        // 0.9 (correct) lands in bin 3, 0.7 (wrong) in bin 2.
        assert_eq!(overall[3].num_in_range, 1);
        assert_eq!(overall[3].num_obs_in_range, 1);
        assert_eq!(overall[2].num_in_range, 1);
        assert_eq!(overall[2].num_obs_in_range, 0);
        assert_eq!(overall[0].num_in_range, 0);
        assert_eq!(overall[2].num_below, 1);
        assert_eq!(overall[3].num_below, 2);
        assert_relative_eq!(overall[3].sum_conf_below, 1.6, epsilon = 1e-6);
        assert!(overall.iter().all(|t| t.num_correct == 1));
        assert_eq!(acc.pixels(), 2);
    }

    #[test]
    fn test_per_class_tallies_use_channel_probability() {
        let (mean, labels) = batch();
        let mut acc = CalibrationAccumulator::new(BinSet::new(4).unwrap(), 2);
        acc.accumulate(&mean, &labels).unwrap();

        let class0 = acc.per_class(0).unwrap();
        assert_eq!(class0[3].num_in_range, 1);
        assert_eq!(class0[3].num_obs_in_range, 1);
        assert_eq!(class0[1].num_in_range, 1);
        assert_eq!(class0[1].num_obs_in_range, 1);

        let class1 = acc.per_class(1).unwrap();
        assert_eq!(class1[0].num_in_range, 1);
        assert_eq!(class1[2].num_in_range, 1);
        assert_eq!(class1[2].num_obs_in_range, 0);
        assert!(class1.iter().all(|t| t.num_correct == 0));
    }

    #[test]
    fn test_merge_equals_joint_accumulation() {
        let (mean, labels) = batch();
        let mut joint = CalibrationAccumulator::new(BinSet::new(5).unwrap(), 2);
        joint.accumulate(&mean, &labels).unwrap();
        joint.accumulate(&mean, &labels).unwrap();

        let mut a = CalibrationAccumulator::new(BinSet::new(5).unwrap(), 2);
        a.accumulate(&mean, &labels).unwrap();
        let b = a.clone();
        a.merge(&b).unwrap();
        assert_eq!(a, joint);

        let other = CalibrationAccumulator::new(BinSet::new(3).unwrap(), 2);
        assert!(a.merge(&other).is_err());
    }

    #[test]
    fn test_rejects_mismatched_shapes_and_skips_ignored_labels() {
        let (mean, mut labels) = batch();
        let mut acc = CalibrationAccumulator::new(BinSet::new(4).unwrap(), 3);
        assert!(acc.accumulate(&mean, &labels).is_err());

        let mut acc = CalibrationAccumulator::new(BinSet::new(4).unwrap(), 2);
        labels[[0, 0, 0]] = 250;
        acc.accumulate(&mean, &labels).unwrap();
        assert_eq!(acc.pixels(), 1);
        assert!(acc.accumulate(&mean, &Array3::zeros((1, 2, 2))).is_err());
    }
}
