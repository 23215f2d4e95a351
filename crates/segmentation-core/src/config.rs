use std::env;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{
    FusionKind, RecalibrationPoint, RecalibratorKind, ScalingKind, SegError, SegResult, StageName,
};

/// Model construction options for one MCDO segmentation network.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub n_classes: usize,
    pub in_channels: usize,
    pub batch_size: usize,
    pub img_rows: usize,
    pub img_cols: usize,
    /// Channel-width multiplier for the reference stages (1.0 = full SegNet widths)
    pub reduction: f32,
    pub mcdo_passes: usize,
    #[serde(rename = "dropoutP")]
    pub dropout_p: f32,
    pub start_layer: String,
    pub end_layer: String,
    pub recalibrator: String,
    pub bins: usize,
    pub recalibration_point: String,
    pub fusion_module: String,
    pub scaling_module: String,
    pub seed: Option<u64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_classes: 11,
            in_channels: 3,
            batch_size: 2,
            img_rows: 512,
            img_cols: 512,
            reduction: 1.0,
            mcdo_passes: 1,
            dropout_p: 0.1,
            start_layer: "down1".to_string(),
            end_layer: "up1".to_string(),
            recalibrator: "None".to_string(),
            bins: 0,
            recalibration_point: "None".to_string(),
            fusion_module: "None".to_string(),
            scaling_module: "None".to_string(),
            seed: None,
        }
    }
}

fn env_or<T>(key: &str, default: T) -> SegResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| SegError::InvalidConfig(format!("{}={}: {}", key, raw, e))),
        Err(_) => Ok(default),
    }
}

impl ModelConfig {
    /// Read the configuration from environment variables, falling back to defaults.
    pub fn from_env() -> SegResult<Self> {
        let defaults = Self::default();
        let seed = match env::var("SEED") {
            Ok(raw) => Some(
                raw.trim()
                    .parse()
                    .map_err(|e| SegError::InvalidConfig(format!("SEED={}: {}", raw, e)))?,
            ),
            Err(_) => None,
        };

        let config = Self {
            n_classes: env_or("N_CLASSES", defaults.n_classes)?,
            in_channels: env_or("IN_CHANNELS", defaults.in_channels)?,
            batch_size: env_or("BATCH_SIZE", defaults.batch_size)?,
            img_rows: env_or("IMG_ROWS", defaults.img_rows)?,
            img_cols: env_or("IMG_COLS", defaults.img_cols)?,
            reduction: env_or("REDUCTION", defaults.reduction)?,
            mcdo_passes: env_or("MCDO_PASSES", defaults.mcdo_passes)?,
            dropout_p: env_or("DROPOUT_P", defaults.dropout_p)?,
            start_layer: env_or("START_LAYER", defaults.start_layer)?,
            end_layer: env_or("END_LAYER", defaults.end_layer)?,
            recalibrator: env_or("RECALIBRATOR", defaults.recalibrator)?,
            bins: env_or("BINS", defaults.bins)?,
            recalibration_point: env_or("RECALIBRATION_POINT", defaults.recalibration_point)?,
            fusion_module: env_or("FUSION_MODULE", defaults.fusion_module)?,
            scaling_module: env_or("SCALING_MODULE", defaults.scaling_module)?,
            seed,
        };

        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> SegResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn recalibrator_kind(&self) -> SegResult<RecalibratorKind> {
        self.recalibrator.parse()
    }

    pub fn recalibration_point_kind(&self) -> SegResult<RecalibrationPoint> {
        self.recalibration_point.parse()
    }

    pub fn fusion_kind(&self) -> SegResult<FusionKind> {
        self.fusion_module.parse()
    }

    pub fn scaling_kind(&self) -> SegResult<ScalingKind> {
        self.scaling_module.parse()
    }

    /// Resolve `[start_layer, end_layer]` against the canonical stage ordering.
    pub fn layer_window(&self) -> SegResult<(StageName, StageName)> {
        let start: StageName = self.start_layer.parse()?;
        let end: StageName = self.end_layer.parse()?;
        if start > end {
            return Err(SegError::InvalidWindow {
                start: self.start_layer.clone(),
                end: self.end_layer.clone(),
            });
        }
        Ok((start, end))
    }

    /// Startup-time validation. Unknown strategy names are fatal here.
    pub fn validate(&self) -> SegResult<()> {
        if self.n_classes == 0 {
            return Err(SegError::InvalidConfig("n_classes must be >= 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(SegError::InvalidConfig("batch_size must be >= 1".to_string()));
        }
        if self.mcdo_passes == 0 {
            return Err(SegError::InvalidConfig("mcdo_passes must be >= 1".to_string()));
        }
        if !(self.dropout_p > 0.0 && self.dropout_p < 1.0) {
            return Err(SegError::InvalidConfig(format!(
                "dropoutP must lie in (0, 1), got {}",
                self.dropout_p
            )));
        }
        if self.reduction.is_nan() || self.reduction <= 0.0 {
            return Err(SegError::InvalidConfig("reduction must be positive".to_string()));
        }

        let (start, end) = self.layer_window()?;
        let divisor = StageName::ORDERED[start.index()..=end.index()]
            .iter()
            .map(|s| s.scale_divisor())
            .max()
            .unwrap_or(1);
        if self.img_rows == 0
            || self.img_cols == 0
            || self.img_rows % divisor != 0
            || self.img_cols % divisor != 0
        {
            return Err(SegError::InvalidConfig(format!(
                "image size {}x{} must be a non-zero multiple of {}",
                self.img_rows, self.img_cols, divisor
            )));
        }

        let recalibrator = self.recalibrator_kind()?;
        if recalibrator.is_binned() && self.bins < recalibrator.min_points() {
            return Err(SegError::InvalidConfig(format!(
                "recalibrator {} requires at least {} bins, got {}",
                recalibrator,
                recalibrator.min_points(),
                self.bins
            )));
        }
        self.recalibration_point_kind()?;
        self.fusion_kind()?;
        self.scaling_kind()?;

        Ok(())
    }
}
