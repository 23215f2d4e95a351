//! Frozen per-pass dropout masks.
//!
//! A mask is sampled once per `(pass_index, stage)` and reused for every call made
//! with that pass index until the cache is invalidated. Seeds are derived from
//! `(seed, sweep, pass_index, stage)` so two caches built with the same seed hand out
//! identical masks, independently of the order in which passes are requested.

use std::collections::{BTreeSet, HashMap};

use ndarray::{Axis, Zip};
use rand::distributions::{Bernoulli, Distribution};
use rand::rngs::StdRng;
use rand::SeedableRng;
use segmentation_core::{SegError, SegResult, StageName, StageShape, Tensor4};
use tracing::debug;

/// splitmix64 finaliser.
fn mix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Seed for the mask of one stage within one pass of one sweep.
pub fn mask_seed(seed: u64, sweep: u64, pass_index: usize, stage: StageName) -> u64 {
    let mut h = mix64(seed);
    h = mix64(h ^ sweep);
    h = mix64(h ^ pass_index as u64);
    mix64(h ^ stage.index() as u64)
}

#[derive(Debug, Clone)]
pub struct MaskCache {
    dropout_p: f32,
    batch_size: usize,
    seed: u64,
    sweep: u64,
    shapes: Vec<(StageName, StageShape)>,
    masks: HashMap<(usize, StageName), Tensor4>,
    generated: BTreeSet<usize>,
}

impl MaskCache {
    /// `shapes` lists every stochastic stage inside the layer window.
    pub fn new(
        dropout_p: f32,
        batch_size: usize,
        shapes: Vec<(StageName, StageShape)>,
        seed: u64,
    ) -> SegResult<Self> {
        if !(dropout_p > 0.0 && dropout_p < 1.0) {
            return Err(SegError::InvalidConfig(format!(
                "dropoutP must lie in (0, 1), got {}",
                dropout_p
            )));
        }
        Ok(Self {
            dropout_p,
            batch_size,
            seed,
            sweep: 0,
            shapes,
            masks: HashMap::new(),
            generated: BTreeSet::new(),
        })
    }

    pub fn dropout_p(&self) -> f32 {
        self.dropout_p
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn sweep(&self) -> u64 {
        self.sweep
    }

    /// Drop every cached mask and move to the next sweep.
    pub fn invalidate(&mut self) {
        self.masks.clear();
        self.generated.clear();
        self.sweep += 1;
    }

    /// Sample a fresh mask set for `pass_index`, replacing any existing one.
    pub fn regenerate(&mut self, pass_index: usize) -> SegResult<()> {
        let keep = Bernoulli::new(f64::from(1.0 - self.dropout_p))
            .map_err(|e| SegError::InvalidConfig(format!("dropout mask: {}", e)))?;
        let scale = 1.0 / (1.0 - self.dropout_p);

        for (stage, shape) in &self.shapes {
            let mut rng = StdRng::seed_from_u64(mask_seed(self.seed, self.sweep, pass_index, *stage));
            let mask = Tensor4::from_shape_simple_fn(shape.with_batch(self.batch_size), || {
                if keep.sample(&mut rng) {
                    scale
                } else {
                    0.0
                }
            });
            self.masks.insert((pass_index, *stage), mask);
        }
        self.generated.insert(pass_index);

        debug!(
            pass_index,
            sweep = self.sweep,
            stages = self.shapes.len(),
            "Regenerated dropout masks"
        );
        Ok(())
    }

    /// Generate the mask set for `pass_index` if it has not been seen this sweep.
    /// Returns whether new masks were sampled.
    pub fn ensure(&mut self, pass_index: usize) -> SegResult<bool> {
        if self.contains(pass_index) {
            return Ok(false);
        }
        self.regenerate(pass_index)?;
        Ok(true)
    }

    pub fn contains(&self, pass_index: usize) -> bool {
        self.generated.contains(&pass_index)
    }

    pub fn get(&self, pass_index: usize, stage: StageName) -> Option<&Tensor4> {
        self.masks.get(&(pass_index, stage))
    }

    /// Multiply `activation` in place by the frozen mask of `(pass_index, stage)`.
    pub fn apply(&self, pass_index: usize, stage: StageName, activation: &mut Tensor4) -> SegResult<()> {
        let mask = self.get(pass_index, stage).ok_or_else(|| SegError::MaskNotGenerated {
            pass_index,
            stage: stage.to_string(),
        })?;
        if mask.shape()[1..] != activation.shape()[1..] {
            return Err(SegError::ShapeMismatch {
                context: format!("{} activation", stage),
                expected: mask.shape().to_vec(),
                actual: activation.shape().to_vec(),
            });
        }
        if mask.len_of(Axis(0)) != activation.len_of(Axis(0)) {
            return Err(SegError::BatchSizeMismatch {
                stage: stage.to_string(),
                expected: mask.shape().to_vec(),
                actual: activation.shape().to_vec(),
            });
        }
        Zip::from(activation).and(mask).for_each(|a, &m| *a *= m);
        Ok(())
    }
}
