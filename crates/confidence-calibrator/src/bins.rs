//! Confidence bins over `[0, 1]`.

use segmentation_core::{SegError, SegResult};
use serde::{Deserialize, Serialize};

/// Half-open interval `[low, high)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceBin {
    pub low: f64,
    pub high: f64,
}

impl ConfidenceBin {
    pub fn midpoint(&self) -> f64 {
        (self.low + self.high) / 2.0
    }

    pub fn width(&self) -> f64 {
        self.high - self.low
    }
}

/// `bins` equal-width intervals tiling `[0, 1)`. The last interval also absorbs `1.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinSet {
    bins: Vec<ConfidenceBin>,
}

impl BinSet {
    pub fn new(bins: usize) -> SegResult<Self> {
        if bins == 0 {
            return Err(SegError::InvalidConfig("bins must be > 0".to_string()));
        }
        let edge = |k: usize| k as f64 / bins as f64;
        Ok(Self {
            bins: (0..bins)
                .map(|k| ConfidenceBin {
                    low: edge(k),
                    high: edge(k + 1),
                })
                .collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfidenceBin> {
        self.bins.iter()
    }

    pub fn get(&self, index: usize) -> Option<&ConfidenceBin> {
        self.bins.get(index)
    }

    /// Bin holding `confidence`, or `None` outside `[0, 1]` (and for NaN).
    pub fn index_of(&self, confidence: f64) -> Option<usize> {
        if !(0.0..=1.0).contains(&confidence) {
            return None;
        }
        let n = self.bins.len();
        Some(((confidence * n as f64).floor() as usize).min(n - 1))
    }
}
