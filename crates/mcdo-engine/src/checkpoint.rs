//! JSON checkpoints of a layer stack.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use segmentation_core::{SegError, SegResult};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::stack::LayerStack;

/// A parameter tensor stored as its shape plus row-major data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorBlob {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub model_state: BTreeMap<String, TensorBlob>,
    pub epoch: usize,
    pub mean_iou: f64,
    #[serde(default)]
    pub optimizer_state: serde_json::Value,
    #[serde(default)]
    pub scheduler_state: serde_json::Value,
}

/// What [`Checkpoint::apply_to`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub applied: usize,
    pub resized: usize,
    /// Checkpoint keys with no matching parameter.
    pub skipped: usize,
}

/// Truncate or zero-extend a flat buffer to `len` elements.
fn resize_flat(data: &[f32], len: usize) -> Vec<f32> {
    let mut out: Vec<f32> = data.iter().copied().take(len).collect();
    out.resize(len, 0.0);
    out
}

impl Checkpoint {
    pub fn capture(stack: &LayerStack, epoch: usize, mean_iou: f64) -> Self {
        let model_state = stack
            .named_parameters()
            .into_iter()
            .map(|(name, view)| {
                let blob = TensorBlob {
                    shape: view.shape().to_vec(),
                    data: view.iter().copied().collect(),
                };
                (name, blob)
            })
            .collect();

        Self {
            model_state,
            epoch,
            mean_iou,
            optimizer_state: serde_json::Value::Null,
            scheduler_state: serde_json::Value::Null,
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> SegResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec(self)?)?;
        info!(path = %path.display(), epoch = self.epoch, "Saved checkpoint");
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> SegResult<Self> {
        let path = path.as_ref();
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(SegError::CheckpointNotFound(path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Copy every checkpoint tensor whose name the stack knows.
    ///
    /// A tensor whose shape differs from the target is reinterpreted destructively:
    /// its flat data is truncated or zero-extended to the target size, not reshaped.
    pub fn apply_to(&self, stack: &mut LayerStack) -> LoadReport {
        let mut report = LoadReport::default();
        let mut matched = 0;

        for (name, mut target) in stack.named_parameters_mut() {
            let Some(blob) = self.model_state.get(&name) else {
                continue;
            };
            matched += 1;

            if blob.shape.as_slice() != target.shape() {
                warn!(
                    parameter = %name,
                    stored = ?blob.shape,
                    expected = ?target.shape(),
                    "Resizing checkpoint tensor"
                );
                report.resized += 1;
            }
            let data = resize_flat(&blob.data, target.len());
            for (dst, src) in target.iter_mut().zip(data) {
                *dst = src;
            }
            report.applied += 1;
        }
        report.skipped = self.model_state.len() - matched;

        info!(
            applied = report.applied,
            resized = report.resized,
            skipped = report.skipped,
            epoch = self.epoch,
            "Loaded checkpoint state"
        );
        report
    }
}

/// Load pretrained weights into `stack`.
///
/// Without a path, or with a missing file on an optional modality, the stack keeps its
/// random initialisation. A missing file is an error when `required` is set.
pub fn load_pretrained(
    stack: &mut LayerStack,
    path: Option<&Path>,
    required: bool,
) -> SegResult<Option<Checkpoint>> {
    let Some(path) = path else {
        if required {
            return Err(SegError::InvalidConfig(
                "a pretrained checkpoint path is required".to_string(),
            ));
        }
        warn!("No pretrained weights supplied, keeping random initialisation");
        return Ok(None);
    };

    match Checkpoint::load(path) {
        Ok(checkpoint) => {
            checkpoint.apply_to(stack);
            Ok(Some(checkpoint))
        }
        Err(SegError::CheckpointNotFound(missing)) if !required => {
            warn!(
                path = %missing.display(),
                "Pretrained weights not found, keeping random initialisation"
            );
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use segmentation_core::ModelConfig;

    fn config(seed: u64) -> ModelConfig {
        ModelConfig {
            n_classes: 3,
            in_channels: 2,
            batch_size: 1,
            img_rows: 32,
            img_cols: 32,
            reduction: 1.0 / 64.0,
            seed: Some(seed),
            ..Default::default()
        }
    }

    fn params(stack: &LayerStack) -> Vec<(String, Vec<f32>)> {
        stack
            .named_parameters()
            .into_iter()
            .map(|(n, v)| (n, v.iter().copied().collect()))
            .collect()
    }

    #[test]
    fn test_round_trip_restores_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("model.json");

        let mut source = LayerStack::from_config(&config(1)).unwrap();
        source.set_temperature(1.7).unwrap();
        let mut checkpoint = Checkpoint::capture(&source, 12, 0.42);
        checkpoint.optimizer_state = serde_json::json!({"lr": 0.001});
        checkpoint.save(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.epoch, 12);
        assert_eq!(loaded.optimizer_state["lr"], 0.001);

        let mut target = LayerStack::from_config(&config(2)).unwrap();
        assert_ne!(params(&source), params(&target));
        let report = loaded.apply_to(&mut target);
        assert_eq!(report.applied, 21);
        assert_eq!(report.resized, 0);
        assert_eq!(params(&source), params(&target));
        assert_eq!(target.temperature(), 1.7);
    }

    #[test]
    fn test_partial_load_skips_unknown_and_resizes() {
        let mut target = LayerStack::from_config(&config(3)).unwrap();
        let mut checkpoint = Checkpoint::capture(&target, 0, 0.0);
        checkpoint.model_state.clear();
        checkpoint.model_state.insert(
            "classifier.weight".to_string(),
            TensorBlob { shape: vec![2], data: vec![1.0, 2.0] },
        );
        checkpoint.model_state.insert(
            "up1.bias".to_string(),
            TensorBlob { shape: vec![2], data: vec![5.0, 6.0] },
        );
        checkpoint.model_state.insert(
            "temperature".to_string(),
            TensorBlob { shape: vec![3], data: vec![2.5, 9.0, 9.0] },
        );

        let report = checkpoint.apply_to(&mut target);
        assert_eq!(report, LoadReport { applied: 2, resized: 2, skipped: 1 });
        assert_eq!(target.temperature(), 2.5);

        let bias: Vec<f32> = target
            .named_parameters()
            .into_iter()
            .find(|(n, _)| n == "up1.bias")
            .map(|(_, v)| v.iter().copied().collect())
            .unwrap();
        assert_eq!(bias, vec![5.0, 6.0, 0.0]);
    }

    #[test]
    fn test_missing_file_handling() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.json");
        let mut stack = LayerStack::from_config(&config(4)).unwrap();

        assert!(matches!(
            load_pretrained(&mut stack, Some(&missing), true),
            Err(SegError::CheckpointNotFound(_))
        ));
        assert!(load_pretrained(&mut stack, Some(&missing), false).unwrap().is_none());
        assert!(load_pretrained(&mut stack, None, false).unwrap().is_none());
        assert!(load_pretrained(&mut stack, None, true).is_err());
    }
}
