//! Prediction accuracy analytics over resolved predictions.

pub mod calibration;

pub use calibration::{CalibrationDiagnosis, CalibrationReport, Calibrator};
