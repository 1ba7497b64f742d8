//! Outcome resolver.
//!
//! Grades past predictions once their horizon has elapsed. The realized
//! regime of a prediction `P` is the regime predicted by the earliest later
//! cycle stamped at or after `P.timestamp + horizon` whose data was usable
//! (quality other than `unavailable`). Until such a cycle exists, `P` stays
//! pending.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::storage::PredictionStore;
use crate::types::{Regime, RegimeError};

/// Counts from one resolver pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolutionReport {
    pub resolved: usize,
    /// Rows another writer resolved first.
    pub skipped: usize,
    /// Due rows still waiting for a realized regime.
    pub pending: usize,
}

pub struct OutcomeResolver {
    horizon: Duration,
}

impl OutcomeResolver {
    pub fn new(horizon_minutes: i64) -> Self {
        Self {
            horizon: Duration::minutes(horizon_minutes),
        }
    }

    pub fn horizon(&self) -> Duration {
        self.horizon
    }

    /// Resolve every due prediction that has a realized regime.
    pub async fn resolve_due(&self, store: &PredictionStore, now: DateTime<Utc>) -> Result<ResolutionReport> {
        let due = store.pending(now, self.horizon).await?;
        let mut report = ResolutionReport::default();

        for prediction in due {
            let Some(id) = prediction.id else { continue };
            let target = prediction.timestamp + self.horizon;

            let Some(realized) = store.first_usable_at_or_after(target).await? else {
                report.pending += 1;
                continue;
            };

            let actual = realized.predicted_regime;
            let score = Regime::outcome_score(prediction.predicted_regime, actual);

            if store.resolve(id, actual, score, now).await? {
                debug!(
                    id,
                    predicted = %prediction.predicted_regime,
                    actual = %actual,
                    score,
                    "Prediction resolved"
                );
                report.resolved += 1;
            } else {
                debug!("{}", RegimeError::ResolutionRace(id));
                report.skipped += 1;
            }
        }

        if report.resolved > 0 || report.skipped > 0 {
            info!(
                resolved = report.resolved,
                skipped = report.skipped,
                pending = report.pending,
                "Outcome resolution complete"
            );
        }
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
