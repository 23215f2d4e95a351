use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SegError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Recalibrator not supported: {0}")]
    UnknownRecalibrator(String),

    #[error("Fusion module not supported: {0}")]
    UnknownFusionModule(String),

    #[error("Scaling module not supported: {0}")]
    UnknownScalingModule(String),

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Invalid layer window: {start} .. {end}")]
    InvalidWindow { start: String, end: String },

    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Mask for {stage} was sampled for shape {expected:?} but the activation is {actual:?}")]
    BatchSizeMismatch {
        stage: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("No dropout mask generated for pass {pass_index}, stage {stage}")]
    MaskNotGenerated { pass_index: usize, stage: String },

    #[error("Stage {stage} needs pooling indices from {mirror}, which is outside the layer window")]
    MissingPoolIndices { stage: String, mirror: String },

    #[error("Fusion requires at least one modality")]
    EmptyModalities,

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Checkpoint not found: {}", .0.display())]
    CheckpointNotFound(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type SegResult<T> = Result<T, SegError>;
