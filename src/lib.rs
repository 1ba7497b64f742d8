//! REGIME MONITOR — market regime classification with a prediction
//! feedback loop.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod data;
pub mod classifier;
pub mod engine;
pub mod storage;
pub mod notify;
pub mod admin;
pub mod analytics;
pub mod dashboard;
