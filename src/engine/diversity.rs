//! Diversity monitor.
//!
//! Watches the distribution of predicted regimes for monoculture: one
//! regime swallowing the window, or too few distinct regimes. The monitor
//! is a small persisted state machine:
//!
//! ```text
//! Healthy ──N identical in a row──▶ MonocultureSuspected
//! MonocultureSuspected ──window breach──▶ Remediated   (rollback, auto_retrain off, alert)
//! MonocultureSuspected ──streak broken, window balanced──▶ Healthy
//! Remediated ──M balanced cycles in a row──▶ Healthy
//! ```
//!
//! Historical labels are never touched here; see `admin::rebalance`.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::classifier::registry::ModelRegistry;
use crate::config::FeedbackConfig;
use crate::notify::{escape_html, Notifier};
use crate::storage::state::PipelineState;
use crate::storage::PredictionStore;
use crate::types::{Regime, RegimeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiversityPhase {
    #[default]
    Healthy,
    MonocultureSuspected,
    Remediated,
}

impl std::fmt::Display for DiversityPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DiversityPhase::Healthy => "healthy",
            DiversityPhase::MonocultureSuspected => "monoculture_suspected",
            DiversityPhase::Remediated => "remediated",
        })
    }
}

/// Persisted monitor status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiversityStatus {
    pub phase: DiversityPhase,
    /// Consecutive balanced cycles since remediation.
    #[serde(default)]
    pub balanced_cycles: u32,
    #[serde(default)]
    pub last_remediation: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Window report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiversityReport {
    pub window_start: DateTime<Utc>,
    pub total: usize,
    pub counts: BTreeMap<Regime, usize>,
    pub dominant: Option<Regime>,
    /// Share of the dominant regime in [0, 1].
    pub dominant_share: f64,
    pub distinct: usize,
    /// Length of the run of identical predictions ending at the newest one.
    pub streak: usize,
    pub monoculture: bool,
}

impl DiversityReport {
    /// Build a report from the window's regimes, newest first.
    pub fn from_regimes(
        regimes: &[Regime],
        window_start: DateTime<Utc>,
        config: &FeedbackConfig,
    ) -> Self {
        let mut counts: BTreeMap<Regime, usize> = BTreeMap::new();
        for r in regimes {
            *counts.entry(*r).or_insert(0) += 1;
        }
        let total = regimes.len();

        // Ties go to the more bearish regime, so the choice is stable
        let dominant = counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(r, n)| (*r, *n));
        let dominant_share = match (dominant, total) {
            (Some((_, n)), t) if t > 0 => n as f64 / t as f64,
            _ => 0.0,
        };
        let distinct = counts.len();

        let streak = match regimes.first() {
            Some(head) => regimes.iter().take_while(|r| *r == head).count(),
            None => 0,
        };

        let enough = total >= config.min_window_samples;
        let monoculture = enough
            && (dominant_share > config.max_single_regime_pct
                || distinct < config.min_regime_diversity);

        Self {
            window_start,
            total,
            counts,
            dominant: dominant.map(|(r, _)| r),
            dominant_share,
            distinct,
            streak,
            monoculture,
        }
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// What a monitor step decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiversityTransition {
    Unchanged,
    Suspected,
    /// Window breach while suspected: remediation must run.
    Remediate,
    Recovered,
    /// Streak broke before a breach was confirmed.
    Cleared,
}

/// Advance the status by one cycle. Pure.
pub fn advance(
    status: &DiversityStatus,
    report: &DiversityReport,
    config: &FeedbackConfig,
    now: DateTime<Utc>,
) -> (DiversityStatus, DiversityTransition) {
    let mut next = status.clone();
    let streak_hit = report.streak >= config.suspect_after_consecutive;

    let transition = match status.phase {
        DiversityPhase::Healthy if streak_hit => {
            next.phase = DiversityPhase::MonocultureSuspected;
            DiversityTransition::Suspected
        }
        DiversityPhase::Healthy => DiversityTransition::Unchanged,
        DiversityPhase::MonocultureSuspected if report.monoculture => {
            next.phase = DiversityPhase::Remediated;
            next.balanced_cycles = 0;
            next.last_remediation = Some(now);
            DiversityTransition::Remediate
        }
        DiversityPhase::MonocultureSuspected if !streak_hit => {
            next.phase = DiversityPhase::Healthy;
            DiversityTransition::Cleared
        }
        DiversityPhase::MonocultureSuspected => DiversityTransition::Unchanged,
        DiversityPhase::Remediated if report.monoculture => {
            next.balanced_cycles = 0;
            DiversityTransition::Unchanged
        }
        DiversityPhase::Remediated => {
            next.balanced_cycles += 1;
            if next.balanced_cycles >= config.recovery_cycles {
                next.phase = DiversityPhase::Healthy;
                next.balanced_cycles = 0;
                DiversityTransition::Recovered
            } else {
                DiversityTransition::Unchanged
            }
        }
    };

    (next, transition)
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

pub struct DiversityMonitor {
    config: FeedbackConfig,
    models_dir: Option<PathBuf>,
}

impl DiversityMonitor {
    pub fn new(config: FeedbackConfig, models_dir: Option<PathBuf>) -> Self {
        Self { config, models_dir }
    }

    /// Window report ending at `now`.
    pub async fn report(&self, store: &PredictionStore, now: DateTime<Utc>) -> Result<DiversityReport> {
        let window_start = now - Duration::days(self.config.diversity_window_days);
        let regimes = store.regimes_since(window_start).await?;
        Ok(DiversityReport::from_regimes(&regimes, window_start, &self.config))
    }

    /// Run one monitor step, remediating when the state machine says so.
    /// Updates `state` in place; the caller persists it.
    pub async fn check(
        &self,
        store: &PredictionStore,
        state: &mut PipelineState,
        notifier: &dyn Notifier,
        now: DateTime<Utc>,
    ) -> Result<(DiversityReport, DiversityTransition)> {
        let report = self.report(store, now).await?;

        if report.monoculture {
            if let Some(regime) = report.dominant {
                let collapse = RegimeError::DiversityCollapse {
                    regime,
                    share: report.dominant_share * 100.0,
                };
                warn!(
                    distinct = report.distinct,
                    samples = report.total,
                    phase = %state.diversity.phase,
                    "{collapse}"
                );
            }
        }

        let (next, transition) = advance(&state.diversity, &report, &self.config, now);
        state.diversity = next;

        match transition {
            DiversityTransition::Suspected => warn!(
                streak = report.streak,
                regime = ?report.dominant,
                "Monoculture suspected"
            ),
            DiversityTransition::Remediate => self.remediate(&report, state, notifier, now).await,
            DiversityTransition::Recovered => info!(
                cycles = self.config.recovery_cycles,
                "Prediction diversity recovered"
            ),
            DiversityTransition::Cleared => info!("Monoculture suspicion cleared"),
            DiversityTransition::Unchanged => {}
        }

        Ok((report, transition))
    }

    async fn remediate(
        &self,
        report: &DiversityReport,
        state: &mut PipelineState,
        notifier: &dyn Notifier,
        now: DateTime<Utc>,
    ) {
        let rollback = match &self.models_dir {
            Some(dir) => match ModelRegistry::open(dir).rollback_to_baseline() {
                Ok(true) => "model rolled back to baseline".to_string(),
                Ok(false) => "model already at baseline".to_string(),
                Err(e) => {
                    error!(error = %e, "Baseline rollback failed during remediation");
                    format!("rollback failed: {e}")
                }
            },
            None => "no model registry, ladder in use".to_string(),
        };

        state.overrides.auto_retrain = Some(false);
        state.overrides.reason = Some("diversity remediation".into());
        state.overrides.updated_at = Some(now);

        let regime = report.dominant.unwrap_or(Regime::NEUTRAL);
        warn!(
            regime = %regime,
            share = report.dominant_share,
            rollback = %rollback,
            "Diversity remediation applied, auto-retrain disabled"
        );

        let message = format!(
            "⚠️ <b>Regime diversity collapse</b>\n\
             {} {} at {:.0}% of {} predictions ({} distinct) since {}\n\
             Action: {}; auto-retrain disabled.",
            regime.emoji(),
            regime,
            report.dominant_share * 100.0,
            report.total,
            report.distinct,
            report.window_start.format("%Y-%m-%d %H:%M UTC"),
            escape_html(&rollback),
        );
        if let Err(e) = notifier.send(&message).await {
            warn!(error = %e, notifier = notifier.name(), "Diversity alert not delivered");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
