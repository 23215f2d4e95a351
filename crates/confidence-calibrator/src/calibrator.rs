//! One-dimensional recalibration models.
//!
//! Every model maps a raw confidence to a calibrated confidence and is fitted from
//! `(predicted, observed)` reliability points sorted by ascending prediction.

use nalgebra::{DMatrix, DVector};
use ndarray::Axis;
use segmentation_core::{LabelMap, RecalibratorKind, SegError, SegResult, Tensor4};
use serde::{Deserialize, Serialize};

/// Common fit/predict contract of the recalibration models.
pub trait Recalibrator {
    fn fit(&mut self, x: &[f64], y: &[f64]) -> SegResult<()>;

    fn predict(&self, x: f64) -> f64;
}

fn check_points(x: &[f64], y: &[f64], minimum: usize) -> SegResult<()> {
    if x.len() != y.len() {
        return Err(SegError::ShapeMismatch {
            context: "calibration points".to_string(),
            expected: vec![x.len()],
            actual: vec![y.len()],
        });
    }
    if x.len() < minimum {
        return Err(SegError::InsufficientData(format!(
            "need at least {} calibration points, got {}",
            minimum,
            x.len()
        )));
    }
    Ok(())
}

fn sorted_pairs(x: &[f64], y: &[f64]) -> Vec<(f64, f64)> {
    let mut pairs: Vec<(f64, f64)> = x.iter().copied().zip(y.iter().copied()).collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));
    pairs
}

/// Segment index `floor(n * clamp(x, 0, 1)) - 1`, clamped to the fitted segments.
fn segment_index(n_points: usize, n_segments: usize, x: f64) -> usize {
    let raw = (n_points as f64 * x.clamp(0.0, 1.0)).floor() as i64 - 1;
    raw.clamp(0, n_segments as i64 - 1) as usize
}

/// Piecewise-linear map through adjacent sorted points (`HistogramLinear`).
///
/// Inputs beyond the fitted range follow the nearest segment's line and are not
/// clipped to `[0, 1]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PiecewiseLinear {
    slopes: Vec<f64>,
    intercepts: Vec<f64>,
    n_points: usize,
}

impl Recalibrator for PiecewiseLinear {
    fn fit(&mut self, x: &[f64], y: &[f64]) -> SegResult<()> {
        check_points(x, y, 2)?;
        let pairs = sorted_pairs(x, y);
        self.slopes.clear();
        self.intercepts.clear();
        for w in pairs.windows(2) {
            let ((x1, y1), (x2, y2)) = (w[0], w[1]);
            let dx = x2 - x1;
            let slope = if dx.abs() < f64::EPSILON { 0.0 } else { (y2 - y1) / dx };
            self.slopes.push(slope);
            self.intercepts.push(y2 - slope * x2);
        }
        self.n_points = pairs.len();
        Ok(())
    }

    fn predict(&self, x: f64) -> f64 {
        if self.slopes.is_empty() {
            return x;
        }
        let i = segment_index(self.n_points, self.slopes.len(), x);
        self.slopes[i] * x + self.intercepts[i]
    }
}

/// Step function returning each bin's observed accuracy (`HistogramFlat`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistogramFlat {
    values: Vec<f64>,
}

impl Recalibrator for HistogramFlat {
    fn fit(&mut self, x: &[f64], y: &[f64]) -> SegResult<()> {
        check_points(x, y, 1)?;
        self.values = sorted_pairs(x, y).into_iter().map(|(_, v)| v).collect();
        Ok(())
    }

    fn predict(&self, x: f64) -> f64 {
        if self.values.is_empty() {
            return x;
        }
        let n = self.values.len();
        let i = ((n as f64 * x.clamp(0.0, 1.0)).floor() as usize).min(n - 1);
        self.values[i]
    }
}

/// Least-squares polynomial of fixed degree, solved through SVD.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolynomialFit {
    degree: usize,
    /// Lowest order first
    coefficients: Vec<f64>,
}

impl PolynomialFit {
    pub fn new(degree: usize) -> Self {
        Self {
            degree,
            coefficients: Vec::new(),
        }
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }
}

impl Recalibrator for PolynomialFit {
    fn fit(&mut self, x: &[f64], y: &[f64]) -> SegResult<()> {
        check_points(x, y, self.degree + 1)?;
        let design = DMatrix::from_fn(x.len(), self.degree + 1, |r, c| x[r].powi(c as i32));
        let target = DVector::from_column_slice(y);
        let solution = design
            .svd(true, true)
            .solve(&target, 1e-12)
            .map_err(|e| SegError::InsufficientData(format!("polynomial fit: {}", e)))?;
        self.coefficients = solution.iter().copied().collect();
        Ok(())
    }

    fn predict(&self, x: f64) -> f64 {
        if self.coefficients.is_empty() {
            return x;
        }
        self.coefficients.iter().rev().fold(0.0, |acc, c| acc * x + c)
    }
}

/// Isotonic regression (pool adjacent violators) with linear interpolation between
/// fitted points.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IsotonicFit {
    table: Vec<(f64, f64)>,
}

impl Recalibrator for IsotonicFit {
    fn fit(&mut self, x: &[f64], y: &[f64]) -> SegResult<()> {
        check_points(x, y, 1)?;
        let pairs = sorted_pairs(x, y);

        // Blocks of (mean value, weight, members).
        let mut blocks: Vec<(f64, f64, usize)> = Vec::with_capacity(pairs.len());
        for &(_, v) in &pairs {
            blocks.push((v, 1.0, 1));
            while blocks.len() > 1 {
                let last = blocks[blocks.len() - 1];
                let prev = blocks[blocks.len() - 2];
                if prev.0 <= last.0 {
                    break;
                }
                let weight = prev.1 + last.1;
                let pooled = (prev.0 * prev.1 + last.0 * last.1) / weight;
                blocks.truncate(blocks.len() - 2);
                blocks.push((pooled, weight, prev.2 + last.2));
            }
        }

        self.table.clear();
        let mut values = blocks.iter().flat_map(|&(v, _, n)| std::iter::repeat(v).take(n));
        for &(px, _) in &pairs {
            let Some(v) = values.next() else { break };
            if let Some(last) = self.table.last_mut() {
                if last.0 == px {
                    last.1 = last.1.max(v);
                    continue;
                }
            }
            self.table.push((px, v));
        }
        Ok(())
    }

    fn predict(&self, x: f64) -> f64 {
        let (Some(first), Some(last)) = (self.table.first(), self.table.last()) else {
            return x;
        };

        match self.table.binary_search_by(|point| point.0.total_cmp(&x)) {
            Ok(idx) => self.table[idx].1,
            Err(0) => first.1,
            Err(idx) if idx >= self.table.len() => last.1,
            Err(idx) => {
                let (x0, y0) = self.table[idx - 1];
                let (x1, y1) = self.table[idx];
                let t = (x - x0) / (x1 - x0);
                y0 + t * (y1 - y0)
            }
        }
    }
}

/// Logistic fit `1 / (1 + exp(-(a x + b)))` by gradient descent on cross-entropy.
///
/// Descent always starts from `a = b = 0`; an unfitted model predicts 0.5.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlattFit {
    a: f64,
    b: f64,
    learning_rate: f64,
    iterations: usize,
}

impl Default for PlattFit {
    fn default() -> Self {
        Self {
            a: 0.0,
            b: 0.0,
            learning_rate: 0.5,
            iterations: 5000,
        }
    }
}

impl PlattFit {
    pub fn parameters(&self) -> (f64, f64) {
        (self.a, self.b)
    }
}

impl Recalibrator for PlattFit {
    fn fit(&mut self, x: &[f64], y: &[f64]) -> SegResult<()> {
        check_points(x, y, 2)?;
        let mut a = 0.0;
        let mut b = 0.0;
        let n = x.len() as f64;

        for _ in 0..self.iterations {
            let mut grad_a = 0.0;
            let mut grad_b = 0.0;

            for (pred, target) in x.iter().zip(y) {
                let p = 1.0 / (1.0 + (-a * pred - b).exp());
                let error = p - target;
                grad_a += error * pred;
                grad_b += error;
            }

            a -= self.learning_rate * grad_a / n;
            b -= self.learning_rate * grad_b / n;
        }

        self.a = a;
        self.b = b;
        Ok(())
    }

    fn predict(&self, x: f64) -> f64 {
        1.0 / (1.0 + (-self.a * x - self.b).exp())
    }
}

/// Binned recalibration model selected by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CalibrationModel {
    HistogramFlat(HistogramFlat),
    HistogramLinear(PiecewiseLinear),
    Polynomial(PolynomialFit),
    Isotonic(IsotonicFit),
    Platt(PlattFit),
}

impl CalibrationModel {
    /// Model for a binned recalibrator kind.
    pub fn build(kind: RecalibratorKind) -> SegResult<Self> {
        match kind {
            RecalibratorKind::HistogramFlat => Ok(Self::HistogramFlat(HistogramFlat::default())),
            RecalibratorKind::HistogramLinear => Ok(Self::HistogramLinear(PiecewiseLinear::default())),
            RecalibratorKind::Polynomial { degree } => Ok(Self::Polynomial(PolynomialFit::new(degree))),
            RecalibratorKind::Isotonic => Ok(Self::Isotonic(IsotonicFit::default())),
            RecalibratorKind::Platt => Ok(Self::Platt(PlattFit::default())),
            RecalibratorKind::None | RecalibratorKind::TemperatureScaling => Err(SegError::InvalidConfig(
                format!("{} is not a binned recalibrator", kind),
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::HistogramFlat(_) => "HistogramFlat",
            Self::HistogramLinear(_) => "HistogramLinear",
            Self::Polynomial(_) => "Polynomial",
            Self::Isotonic(_) => "Isotonic",
            Self::Platt(_) => "Platt",
        }
    }
}

impl Recalibrator for CalibrationModel {
    fn fit(&mut self, x: &[f64], y: &[f64]) -> SegResult<()> {
        match self {
            Self::HistogramFlat(m) => m.fit(x, y),
            Self::HistogramLinear(m) => m.fit(x, y),
            Self::Polynomial(m) => m.fit(x, y),
            Self::Isotonic(m) => m.fit(x, y),
            Self::Platt(m) => m.fit(x, y),
        }
    }

    fn predict(&self, x: f64) -> f64 {
        match self {
            Self::HistogramFlat(m) => m.predict(x),
            Self::HistogramLinear(m) => m.predict(x),
            Self::Polynomial(m) => m.predict(x),
            Self::Isotonic(m) => m.predict(x),
            Self::Platt(m) => m.predict(x),
        }
    }
}

/// Grid search for the logit temperature minimising the negative log-likelihood of
/// `labels` under `softmax(logits / t)`, `t` in `0.1, 0.2, ..., 10.0`.
pub fn fit_temperature(logits: &Tensor4, labels: &LabelMap) -> SegResult<f32> {
    let (batch, n_classes, rows, cols) = logits.dim();
    if labels.dim() != (batch, rows, cols) {
        return Err(SegError::ShapeMismatch {
            context: "temperature fit labels".to_string(),
            expected: vec![batch, rows, cols],
            actual: labels.shape().to_vec(),
        });
    }

    let mut samples: Vec<(Vec<f64>, usize)> = Vec::new();
    for (b, sample) in logits.axis_iter(Axis(0)).enumerate() {
        for r in 0..rows {
            for c in 0..cols {
                let truth = labels[[b, r, c]];
                if truth < n_classes {
                    let pixel = sample.slice(ndarray::s![.., r, c]);
                    samples.push((pixel.iter().map(|&v| f64::from(v)).collect(), truth));
                }
            }
        }
    }
    if samples.is_empty() {
        return Err(SegError::InsufficientData(
            "no labelled pixels for temperature scaling".to_string(),
        ));
    }

    let nll = |t: f64| -> f64 {
        samples
            .iter()
            .map(|(z, truth)| {
                let max = z.iter().fold(f64::NEG_INFINITY, |m, &v| m.max(v / t));
                let log_sum = z.iter().map(|&v| (v / t - max).exp()).sum::<f64>().ln() + max;
                log_sum - z[*truth] / t
            })
            .sum()
    };

    let mut best_temp = 1.0;
    let mut best_loss = f64::MAX;
    for t in (1..=100).map(|i| i as f64 * 0.1) {
        let loss = nll(t);
        if loss < best_loss {
            best_loss = loss;
            best_temp = t;
        }
    }
    Ok(best_temp as f32)
}
