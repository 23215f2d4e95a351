//! Monte-Carlo Dropout engine
//!
//! A SegNet-style layer stack whose deep stages carry frozen per-pass dropout
//! masks, and an aggregator that runs the stack several times and reduces the
//! pass ensemble to mean, variance, entropy and mutual information.

pub mod checkpoint;
pub mod ensemble;
pub mod loss;
pub mod masks;
pub mod stack;
pub mod stage;
pub mod uncertainty;

pub use checkpoint::{load_pretrained, Checkpoint, LoadReport, TensorBlob};
pub use ensemble::{recalibrate_channels, EnsembleOutput, McdoModel};
pub use loss::cross_entropy;
pub use masks::{mask_seed, MaskCache};
pub use stack::{LayerStack, Mode, PassOutput, StageRecord, DEFAULT_SEED};
pub use stage::{reference_stages, DecoderStage, EncoderStage, PoolIndices, StageOutput, StageTransform};
pub use uncertainty::{entropy_and_mutual_information, moments, softmax_classes, PROB_FLOOR};
