//! Confidence Recalibration Engine
//!
//! Bins predicted-vs-observed confidence over validation batches, derives reliability
//! curves (overall and per class) and fits a one-dimensional model mapping raw
//! confidence to calibrated confidence for every class channel.

pub mod accumulator;
pub mod bins;
pub mod calibrator;
pub mod diagram;
pub mod engine;
pub mod stats;

pub use accumulator::{BinTally, CalibrationAccumulator};
pub use bins::{BinSet, ConfidenceBin};
pub use calibrator::{
    fit_temperature, CalibrationModel, HistogramFlat, IsotonicFit, PiecewiseLinear, PlattFit,
    PolynomialFit, Recalibrator,
};
pub use diagram::{write_reliability_diagrams, ClassPanel, DiagramPanel, RecalibratedPoint, CURVE_STEP};
pub use engine::{FitSlot, FitState, RecalibrationEngine};
pub use stats::{cumulative_curve, fit_points, reliability_curve, CalibrationStats, ReliabilityPoint};
