//! Administrative tools, run by an operator and never from the cycle.
//!
//! `rebalance` rewrites the reporting label (`analytics_regime`) of
//! predictions carrying the window's dominant regime, using the
//! deterministic ladder on the stored snapshot. `predicted_regime` and
//! `actual_regime` are never modified. `rollback` points the model registry
//! back at its baseline version.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::path::Path;
use tracing::{info, warn};

use crate::classifier::ladder::LadderClassifier;
use crate::classifier::registry::ModelRegistry;
use crate::classifier::RegimeClassifier;
use crate::config::FeedbackConfig;
use crate::engine::diversity::DiversityReport;
use crate::storage::PredictionStore;
use crate::types::{Regime, RegimeError};

#[derive(Debug, Clone, PartialEq)]
pub struct RebalanceReport {
    pub window_start: DateTime<Utc>,
    pub dominant: Option<Regime>,
    pub dominant_share: f64,
    /// Predictions carrying the dominant regime.
    pub examined: usize,
    /// Of those, how many got a label different from their prediction.
    pub relabeled: usize,
}

/// Relabel the dominant regime's predictions for reporting.
///
/// Refused unless `force_diversity` is set in config or `force` is passed.
pub async fn rebalance(
    store: &PredictionStore,
    feedback: &FeedbackConfig,
    max_ratio: f64,
    force: bool,
    now: DateTime<Utc>,
) -> Result<RebalanceReport> {
    if !(feedback.force_diversity || force) {
        return Err(RegimeError::Config(
            "rebalance rewrites reporting labels; set feedback.force_diversity = true or pass --force".into(),
        )
        .into());
    }

    let window_start = now - Duration::days(feedback.diversity_window_days);
    let predictions = store.range(window_start, now + Duration::seconds(1)).await?;
    let regimes: Vec<Regime> = predictions.iter().rev().map(|p| p.predicted_regime).collect();
    let distribution = DiversityReport::from_regimes(&regimes, window_start, feedback);

    let mut report = RebalanceReport {
        window_start,
        dominant: distribution.dominant,
        dominant_share: distribution.dominant_share,
        examined: 0,
        relabeled: 0,
    };
    let Some(dominant) = distribution.dominant else {
        info!("No predictions in window, nothing to rebalance");
        return Ok(report);
    };

    let ladder = LadderClassifier::new(max_ratio);
    for p in predictions.iter().filter(|p| p.predicted_regime == dominant) {
        let Some(id) = p.id else { continue };
        let label = ladder.classify(&p.indicators).regime;
        store.set_analytics_label(id, label).await?;
        report.examined += 1;
        if label != p.predicted_regime {
            report.relabeled += 1;
        }
    }

    warn!(
        dominant = %dominant,
        share = format!("{:.0}%", report.dominant_share * 100.0),
        examined = report.examined,
        relabeled = report.relabeled,
        "Analytics labels rebalanced"
    );
    Ok(report)
}

/// Roll the registry back to its baseline. `false` when already there.
pub fn rollback(models_dir: Option<&str>) -> Result<bool> {
    let dir = models_dir
        .ok_or_else(|| RegimeError::Config("model.models_dir is not configured".into()))?;
    ModelRegistry::open(Path::new(dir)).rollback_to_baseline()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
