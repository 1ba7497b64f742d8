//! Regime classification.
//!
//! Defines the `RegimeClassifier` trait and its two strategies: the
//! deterministic ratio ladder and a versioned trained model. Classifiers
//! are total: every snapshot yields exactly one regime and a confidence
//! in [0, 1].

pub mod ladder;
pub mod model;
pub mod registry;

use std::path::Path;

use tracing::{info, warn};

use crate::config::FeedbackConfig;
use crate::types::{ComponentScores, IndicatorSnapshot, Regime, Strategy};

use ladder::LadderClassifier;
use model::ModelClassifier;
use registry::ModelRegistry;

/// The classifier's answer for one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub regime: Regime,
    pub confidence: f64,
    pub scores: ComponentScores,
    pub reasoning: String,
    pub strategy: Strategy,
    pub model_version: Option<String>,
}

/// Abstraction over regime classifiers.
pub trait RegimeClassifier: Send + Sync {
    /// Classify a sanitized snapshot. Must not panic for any finite input.
    fn classify(&self, snapshot: &IndicatorSnapshot) -> Classification;

    /// Identifier for logging.
    fn name(&self) -> &str;
}

/// Clip into `[lo, hi]`, mapping NaN to `fallback`.
pub(crate) fn clip(value: f64, lo: f64, hi: f64, fallback: f64) -> f64 {
    if value.is_nan() {
        fallback
    } else {
        value.clamp(lo, hi)
    }
}

/// Derive component scores from a snapshot.
///
/// `market` maps the reversal ratio onto [-1, 1] in log space so that a
/// ratio of `max_ratio` scores 1 and its reciprocal scores -1.
pub fn component_scores(snapshot: &IndicatorSnapshot, max_ratio: f64) -> ComponentScores {
    let log_cap = max_ratio.max(1.0 + f64::EPSILON).ln();
    let ratio = if snapshot.reversal_ratio.is_finite() && snapshot.reversal_ratio > 0.0 {
        snapshot.reversal_ratio
    } else {
        1.0
    };
    let avg_breadth = (snapshot.breadth_20 + snapshot.breadth_50) / 2.0;

    ComponentScores {
        market: clip(ratio.ln() / log_cap, -1.0, 1.0, 0.0),
        trend: clip(snapshot.trend, -1.0, 1.0, 0.0),
        momentum: clip(snapshot.momentum, -1.0, 1.0, 0.0),
        volatility: clip(snapshot.volatility, 0.0, 1.0, 0.5),
        breadth: clip((avg_breadth - 50.0) / 50.0, -1.0, 1.0, 0.0),
    }
}

/// Pick the classifier for this cycle.
///
/// Emergency mode and a missing model directory both mean the ladder.
/// Any failure to load the current model falls back to the ladder with
/// reduced confidence.
pub fn select_classifier(
    feedback: &FeedbackConfig,
    models_dir: Option<&str>,
    max_ratio: f64,
) -> Box<dyn RegimeClassifier> {
    if feedback.emergency_mode {
        warn!("Emergency mode: classifying with the deterministic ladder");
        return Box::new(LadderClassifier::new(max_ratio));
    }

    let Some(dir) = models_dir else {
        return Box::new(LadderClassifier::new(max_ratio));
    };

    match ModelRegistry::open(Path::new(dir)).load_current() {
        Ok(bundle) => {
            info!(version = %bundle.metadata.version, "Loaded regime model");
            Box::new(ModelClassifier::new(bundle, max_ratio))
        }
        Err(e) => {
            warn!(error = %e, "Model unavailable, falling back to ladder");
            Box::new(LadderClassifier::fallback(max_ratio))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
