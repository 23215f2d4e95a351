use anyhow::{bail, Context, Result};
use segmentation_core::{Modality, ModelConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::env;
use std::path::{Path, PathBuf};

/// A sensor modality and its optional pretrained weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModalitySpec {
    pub name: String,
    #[serde(default)]
    pub checkpoint: Option<PathBuf>,
}

impl ModalitySpec {
    pub fn modality(&self) -> Modality {
        Modality::new(self.name.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub model: ModelConfig,
    pub logdir: PathBuf,
    pub modalities: Vec<ModalitySpec>,
    pub val_batches: usize,   // batches per validation
    pub iterations: usize,    // total iterations
    pub val_interval: usize,  // validate every N iterations
    pub save_interval: usize, // periodic checkpoints, 0 = off
    pub resume: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            logdir: default_logdir(),
            modalities: vec![
                ModalitySpec { name: "rgb".to_string(), checkpoint: None },
                ModalitySpec { name: "d".to_string(), checkpoint: None },
            ],
            val_batches: 4,
            iterations: 1,
            val_interval: 1,
            save_interval: 0,
            resume: None,
        }
    }
}

fn default_logdir() -> PathBuf {
    PathBuf::from("runs").join(chrono::Utc::now().format("%Y%m%d-%H%M%S").to_string())
}

impl RunConfig {
    pub fn from_env() -> Result<Self> {
        let model = ModelConfig::from_env().context("Failed to read model configuration")?;

        let modalities = env::var("MODALITIES")
            .unwrap_or_else(|_| "rgb,d".to_string())
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|name| ModalitySpec {
                name: name.to_string(),
                checkpoint: env::var(format!("{}_CHECKPOINT", name.to_uppercase()))
                    .ok()
                    .map(PathBuf::from),
            })
            .collect();

        let config = Self {
            model,
            logdir: env::var("LOGDIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_logdir()),
            modalities,
            val_batches: env::var("VAL_BATCHES")
                .unwrap_or_else(|_| "4".to_string())
                .parse()
                .context("VAL_BATCHES must be an integer")?,
            iterations: env::var("ITERATIONS")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .context("ITERATIONS must be an integer")?,
            val_interval: env::var("VAL_INTERVAL")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .context("VAL_INTERVAL must be an integer")?,
            save_interval: env::var("SAVE_INTERVAL")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .context("SAVE_INTERVAL must be an integer")?,
            resume: env::var("RESUME").ok().map(PathBuf::from),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read run configuration {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid run configuration {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.model.validate().context("Invalid model configuration")?;

        if self.modalities.is_empty() {
            bail!("At least one modality must be configured");
        }
        let names: BTreeSet<&str> = self.modalities.iter().map(|m| m.name.as_str()).collect();
        if names.len() != self.modalities.len() {
            bail!("Modality names must be unique");
        }
        if self.val_batches == 0 {
            bail!("VAL_BATCHES must be >= 1");
        }
        if self.val_interval == 0 {
            bail!("VAL_INTERVAL must be >= 1");
        }
        Ok(())
    }

    /// Fix the seed for the run, drawing a time-based one when none is configured.
    pub fn resolve_seed(&mut self) -> u64 {
        match self.model.seed {
            Some(seed) => seed,
            None => {
                let seed = chrono::Utc::now().timestamp_micros().unsigned_abs();
                self.model.seed = Some(seed);
                tracing::info!(seed, "No seed configured, using a time-based seed");
                seed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_json_config_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "model": {{"n_classes": 4, "img_rows": 64, "img_cols": 64, "mcdo_passes": 3,
                           "recalibrator": "Isotonic", "bins": 8, "recalibration_point": "afterMCDO"}},
                "logdir": "/tmp/run",
                "modalities": [{{"name": "rgb", "checkpoint": "rgb.json"}}]
            }}"#
        )
        .unwrap();

        let config = RunConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.model.n_classes, 4);
        assert_eq!(config.model.bins, 8);
        assert_eq!(config.modalities.len(), 1);
        assert_eq!(config.modalities[0].checkpoint, Some(PathBuf::from("rgb.json")));
        assert_eq!(config.val_interval, 1);
        assert_eq!(config.save_interval, 0);
    }

    #[test]
    fn test_rejects_duplicate_or_missing_modalities() {
        let mut config = RunConfig::default();
        config.model.img_rows = 64;
        config.model.img_cols = 64;
        assert!(config.validate().is_ok());

        config.modalities.push(ModalitySpec { name: "rgb".to_string(), checkpoint: None });
        assert!(config.validate().is_err());

        config.modalities.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_fusion_module_is_fatal() {
        let mut config = RunConfig::default();
        config.model.fusion_module = "2.1".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_seed_keeps_configured_seed() {
        let mut config = RunConfig::default();
        config.model.seed = Some(42);
        assert_eq!(config.resolve_seed(), 42);

        config.model.seed = None;
        let seed = config.resolve_seed();
        assert_eq!(config.model.seed, Some(seed));
    }
}
