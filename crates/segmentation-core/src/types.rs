use std::fmt;
use std::str::FromStr;

use ndarray::{Array3, Array4};
use serde::{Deserialize, Serialize};

use crate::SegError;

/// Activations, logits and probabilities: `(batch, channel, rows, cols)`.
pub type Tensor4 = Array4<f32>;

/// Ground-truth class index per pixel: `(batch, rows, cols)`.
pub type LabelMap = Array3<usize>;

/// One of the ten canonical SegNet stages, declared in forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Down1,
    Down2,
    Down3,
    Down4,
    Down5,
    Up5,
    Up4,
    Up3,
    Up2,
    Up1,
}

impl StageName {
    pub const ORDERED: [StageName; 10] = [
        StageName::Down1,
        StageName::Down2,
        StageName::Down3,
        StageName::Down4,
        StageName::Down5,
        StageName::Up5,
        StageName::Up4,
        StageName::Up3,
        StageName::Up2,
        StageName::Up1,
    ];

    /// Position in the canonical ordering.
    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Down1 => "down1",
            StageName::Down2 => "down2",
            StageName::Down3 => "down3",
            StageName::Down4 => "down4",
            StageName::Down5 => "down5",
            StageName::Up5 => "up5",
            StageName::Up4 => "up4",
            StageName::Up3 => "up3",
            StageName::Up2 => "up2",
            StageName::Up1 => "up1",
        }
    }

    /// The three deepest encoder stages and their decoder mirrors carry a dropout mask.
    pub fn is_stochastic(&self) -> bool {
        matches!(
            self,
            StageName::Down3
                | StageName::Down4
                | StageName::Down5
                | StageName::Up5
                | StageName::Up4
                | StageName::Up3
        )
    }

    pub fn is_encoder(&self) -> bool {
        self.index() < 5
    }

    /// Encoder stage whose pooling indices this decoder stage consumes.
    pub fn mirror(&self) -> Option<StageName> {
        match self {
            StageName::Up5 => Some(StageName::Down5),
            StageName::Up4 => Some(StageName::Down4),
            StageName::Up3 => Some(StageName::Down3),
            StageName::Up2 => Some(StageName::Down2),
            StageName::Up1 => Some(StageName::Down1),
            _ => None,
        }
    }

    /// Output channel width of the full-size network.
    pub fn base_channels(&self, n_classes: usize) -> usize {
        match self {
            StageName::Down1 | StageName::Up2 => 64,
            StageName::Down2 | StageName::Up3 => 128,
            StageName::Down3 | StageName::Up4 => 256,
            StageName::Down4 | StageName::Down5 | StageName::Up5 => 512,
            StageName::Up1 => n_classes,
        }
    }

    /// Output channel width after applying the `reduction` multiplier.
    /// The final stage always emits one channel per class.
    pub fn channels(&self, n_classes: usize, reduction: f32) -> usize {
        match self {
            StageName::Up1 => n_classes,
            _ => ((self.base_channels(n_classes) as f32 * reduction).round() as usize).max(1),
        }
    }

    /// Spatial down-sampling factor of this stage's output relative to the image.
    pub fn scale_divisor(&self) -> usize {
        match self {
            StageName::Down1 | StageName::Up2 => 2,
            StageName::Down2 | StageName::Up3 => 4,
            StageName::Down3 | StageName::Up4 => 8,
            StageName::Down4 | StageName::Up5 => 16,
            StageName::Down5 => 32,
            StageName::Up1 => 1,
        }
    }

    /// Activation shape (without the batch axis) produced by this stage.
    pub fn output_shape(&self, n_classes: usize, reduction: f32, rows: usize, cols: usize) -> StageShape {
        let d = self.scale_divisor();
        StageShape {
            channels: self.channels(n_classes, reduction),
            rows: rows / d,
            cols: cols / d,
        }
    }

    /// Channel width entering this stage.
    pub fn input_channels(&self, in_channels: usize, n_classes: usize, reduction: f32) -> usize {
        match self.index() {
            0 => in_channels,
            i => StageName::ORDERED[i - 1].channels(n_classes, reduction),
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = SegError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageName::ORDERED
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| SegError::UnknownStage(s.to_string()))
    }
}

/// Per-sample activation shape of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageShape {
    pub channels: usize,
    pub rows: usize,
    pub cols: usize,
}

impl StageShape {
    pub fn with_batch(&self, batch_size: usize) -> (usize, usize, usize, usize) {
        (batch_size, self.channels, self.rows, self.cols)
    }
}

/// Sensor modality key (`rgb`, `d`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Modality(String);

impl Modality {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn rgb() -> Self {
        Self::new("rgb")
    }

    pub fn depth() -> Self {
        Self::new("d")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Post-hoc recalibration model selected by the `recalibrator` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecalibratorKind {
    None,
    HistogramFlat,
    HistogramLinear,
    Polynomial { degree: usize },
    Isotonic,
    Platt,
    TemperatureScaling,
}

impl RecalibratorKind {
    /// Kinds that are fitted from binned validation statistics.
    pub fn is_binned(&self) -> bool {
        !matches!(self, RecalibratorKind::None | RecalibratorKind::TemperatureScaling)
    }

    /// Reliability points the fit needs; one point is produced per bin.
    pub fn min_points(&self) -> usize {
        match self {
            RecalibratorKind::None | RecalibratorKind::TemperatureScaling => 0,
            RecalibratorKind::HistogramFlat | RecalibratorKind::Isotonic => 1,
            RecalibratorKind::HistogramLinear | RecalibratorKind::Platt => 2,
            RecalibratorKind::Polynomial { degree } => degree + 1,
        }
    }
}

impl FromStr for RecalibratorKind {
    type Err = SegError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "None" => Ok(RecalibratorKind::None),
            "HistogramFlat" => Ok(RecalibratorKind::HistogramFlat),
            "HistogramLinear" => Ok(RecalibratorKind::HistogramLinear),
            "Isotonic" => Ok(RecalibratorKind::Isotonic),
            "Platt" => Ok(RecalibratorKind::Platt),
            "temperature_scaling" => Ok(RecalibratorKind::TemperatureScaling),
            other => match other.strip_prefix("Polynomial_") {
                Some(degree) => degree
                    .parse()
                    .map(|degree| RecalibratorKind::Polynomial { degree })
                    .map_err(|_| SegError::UnknownRecalibrator(other.to_string())),
                None => Err(SegError::UnknownRecalibrator(other.to_string())),
            },
        }
    }
}

impl fmt::Display for RecalibratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecalibratorKind::None => f.write_str("None"),
            RecalibratorKind::HistogramFlat => f.write_str("HistogramFlat"),
            RecalibratorKind::HistogramLinear => f.write_str("HistogramLinear"),
            RecalibratorKind::Polynomial { degree } => write!(f, "Polynomial_{}", degree),
            RecalibratorKind::Isotonic => f.write_str("Isotonic"),
            RecalibratorKind::Platt => f.write_str("Platt"),
            RecalibratorKind::TemperatureScaling => f.write_str("temperature_scaling"),
        }
    }
}

/// Where the per-class recalibration is applied relative to ensemble aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecalibrationPoint {
    None,
    BeforeMcdo,
    AfterMcdo,
}

impl FromStr for RecalibrationPoint {
    type Err = SegError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "None" => Ok(RecalibrationPoint::None),
            "beforeMCDO" => Ok(RecalibrationPoint::BeforeMcdo),
            "afterMCDO" => Ok(RecalibrationPoint::AfterMcdo),
            other => Err(SegError::InvalidConfig(format!(
                "recalibration_point must be None, beforeMCDO or afterMCDO, got {}",
                other
            ))),
        }
    }
}

/// Fusion policy selected by the `fusion_module` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FusionKind {
    None,
    SoftmaxMultiply,
    SoftmaxAverage,
    WeightedVariance,
    NoisyOr,
    ScaledAverage,
    Gated,
    ConditionalAttention,
    PreweightedGated,
    UncertaintyGated,
}

impl FromStr for FusionKind {
    type Err = SegError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "None" => Ok(FusionKind::None),
            "SoftmaxMultiply" => Ok(FusionKind::SoftmaxMultiply),
            "SoftmaxAverage" => Ok(FusionKind::SoftmaxAverage),
            "WeightedVariance" => Ok(FusionKind::WeightedVariance),
            "Noisy-Or" => Ok(FusionKind::NoisyOr),
            "ScaledAverage" => Ok(FusionKind::ScaledAverage),
            "GatedFusion" | "1.0" => Ok(FusionKind::Gated),
            "ConditionalAttentionFusion" | "1.1" => Ok(FusionKind::ConditionalAttention),
            "PreweightedGatedFusion" | "1.2" => Ok(FusionKind::PreweightedGated),
            "UncertaintyGatedFusion" | "1.3" => Ok(FusionKind::UncertaintyGated),
            other => Err(SegError::UnknownFusionModule(other.to_string())),
        }
    }
}

impl fmt::Display for FusionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FusionKind::None => "None",
            FusionKind::SoftmaxMultiply => "SoftmaxMultiply",
            FusionKind::SoftmaxAverage => "SoftmaxAverage",
            FusionKind::WeightedVariance => "WeightedVariance",
            FusionKind::NoisyOr => "Noisy-Or",
            FusionKind::ScaledAverage => "ScaledAverage",
            FusionKind::Gated => "GatedFusion",
            FusionKind::ConditionalAttention => "ConditionalAttentionFusion",
            FusionKind::PreweightedGated => "PreweightedGatedFusion",
            FusionKind::UncertaintyGated => "UncertaintyGatedFusion",
        };
        f.write_str(name)
    }
}

/// Per-pixel scaling of the MCDO mean selected by the `scaling_module` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalingKind {
    None,
    Temperature,
    Uncertainty,
    GlobalUncertainty,
}

impl FromStr for ScalingKind {
    type Err = SegError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "None" => Ok(ScalingKind::None),
            "temperature" => Ok(ScalingKind::Temperature),
            "uncertainty" => Ok(ScalingKind::Uncertainty),
            "GlobalUncertainty" => Ok(ScalingKind::GlobalUncertainty),
            other => Err(SegError::UnknownScalingModule(other.to_string())),
        }
    }
}
