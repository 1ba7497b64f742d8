//! Persistence layer.
//!
//! Predictions and regime-change events live in SQLite (via `sqlx`).
//! The regime state singleton is a JSON file (`state`), and the dashboard
//! snapshot is a JSON artifact (`artifact`).
//!
//! Timestamps are stored as fixed-width RFC 3339 strings (microsecond
//! precision, `Z` suffix) so that lexical order equals time order and the
//! unique index on `timestamp` rejects duplicate cycle slots.

pub mod artifact;
pub mod state;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::types::{
    ComponentScores, DataQuality, IndicatorSnapshot, Regime, RegimeChangeEvent, RegimeError,
    RegimePrediction, Strategy,
};

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS regime_predictions (
        id                 INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp          TEXT    NOT NULL,
        predicted_regime   TEXT    NOT NULL,
        confidence         REAL    NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
        market_score       REAL    NOT NULL,
        trend_score        REAL    NOT NULL,
        momentum_score     REAL    NOT NULL,
        volatility_score   REAL    NOT NULL,
        breadth_score      REAL    NOT NULL,
        strategy           TEXT    NOT NULL,
        model_version      TEXT,
        data_quality       TEXT    NOT NULL,
        indicators         TEXT    NOT NULL,
        reasoning          TEXT    NOT NULL,
        actual_regime      TEXT,
        outcome_score      REAL    CHECK (outcome_score IS NULL OR (outcome_score >= 0.0 AND outcome_score <= 1.0)),
        feedback_timestamp TEXT,
        analytics_regime   TEXT
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_predictions_timestamp
        ON regime_predictions (timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_predictions_timestamp_desc
        ON regime_predictions (timestamp DESC)",
    "CREATE TABLE IF NOT EXISTS regime_change_events (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp      TEXT NOT NULL,
        from_regime    TEXT NOT NULL,
        to_regime      TEXT NOT NULL,
        confidence     REAL NOT NULL,
        trigger_reason TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_events_timestamp
        ON regime_change_events (timestamp)",
];

const PREDICTION_COLUMNS: &str = "id, timestamp, predicted_regime, confidence, market_score, \
    trend_score, momentum_score, volatility_score, breadth_score, strategy, model_version, \
    data_quality, indicators, reasoning, actual_regime, outcome_score, feedback_timestamp, \
    analytics_regime";

/// Result of appending a prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    /// A prediction already exists for this timestamp; nothing was written.
    Duplicate,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Canonical storage form of a timestamp.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Bad stored timestamp: {raw}"))?
        .with_timezone(&Utc))
}

fn parse_regime(raw: &str) -> Result<Regime> {
    Ok(Regime::from_str(raw)?)
}

fn prediction_from_row(row: &SqliteRow) -> Result<RegimePrediction> {
    let indicators: IndicatorSnapshot = serde_json::from_str(row.try_get::<&str, _>("indicators")?)
        .context("Bad stored indicator snapshot")?;

    Ok(RegimePrediction {
        id: Some(row.try_get("id")?),
        timestamp: parse_ts(row.try_get("timestamp")?)?,
        predicted_regime: parse_regime(row.try_get("predicted_regime")?)?,
        confidence: row.try_get("confidence")?,
        scores: ComponentScores {
            market: row.try_get("market_score")?,
            trend: row.try_get("trend_score")?,
            momentum: row.try_get("momentum_score")?,
            volatility: row.try_get("volatility_score")?,
            breadth: row.try_get("breadth_score")?,
        },
        strategy: Strategy::from_str(row.try_get("strategy")?)?,
        model_version: row.try_get("model_version")?,
        indicators,
        reasoning: row.try_get("reasoning")?,
        actual_regime: row.try_get::<Option<&str>, _>("actual_regime")?
            .map(parse_regime)
            .transpose()?,
        outcome_score: row.try_get("outcome_score")?,
        feedback_timestamp: row.try_get::<Option<&str>, _>("feedback_timestamp")?
            .map(parse_ts)
            .transpose()?,
        analytics_regime: row.try_get::<Option<&str>, _>("analytics_regime")?
            .map(parse_regime)
            .transpose()?,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<RegimeChangeEvent> {
    Ok(RegimeChangeEvent {
        id: Some(row.try_get("id")?),
        timestamp: parse_ts(row.try_get("timestamp")?)?,
        from_regime: parse_regime(row.try_get("from_regime")?)?,
        to_regime: parse_regime(row.try_get("to_regime")?)?,
        confidence: row.try_get("confidence")?,
        trigger_reason: row.try_get("trigger_reason")?,
    })
}

// ---------------------------------------------------------------------------
// Prediction store
// ---------------------------------------------------------------------------

/// Append-only store of predictions and change events.
#[derive(Clone)]
pub struct PredictionStore {
    pool: SqlitePool,
}

impl PredictionStore {
    /// Open (creating if needed) the database file and apply the schema.
    pub async fn connect(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| RegimeError::Storage(format!("cannot open {path}: {e}")))?;
        let store = Self { pool };
        store.migrate().await?;
        info!(path, "Prediction store opened");
        Ok(store)
    }

    /// A private in-memory database (single connection).
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| RegimeError::Storage(format!("cannot open in-memory store: {e}")))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .context("Failed to apply schema")?;
        }
        Ok(())
    }

    /// Append a prediction. A timestamp collision is reported as
    /// `Duplicate`, not an error.
    pub async fn insert(&self, p: &RegimePrediction) -> Result<InsertOutcome> {
        let indicators = serde_json::to_string(&p.indicators)
            .context("Failed to serialise indicator snapshot")?;

        let result = sqlx::query(
            "INSERT INTO regime_predictions (timestamp, predicted_regime, confidence, \
             market_score, trend_score, momentum_score, volatility_score, breadth_score, \
             strategy, model_version, data_quality, indicators, reasoning, actual_regime, \
             outcome_score, feedback_timestamp, analytics_regime) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(format_ts(&p.timestamp))
        .bind(p.predicted_regime.as_str())
        .bind(p.confidence)
        .bind(p.scores.market)
        .bind(p.scores.trend)
        .bind(p.scores.momentum)
        .bind(p.scores.volatility)
        .bind(p.scores.breadth)
        .bind(p.strategy.as_str())
        .bind(p.model_version.as_deref())
        .bind(p.indicators.quality.as_str())
        .bind(indicators)
        .bind(&p.reasoning)
        .bind(p.actual_regime.map(Regime::as_str))
        .bind(p.outcome_score)
        .bind(p.feedback_timestamp.as_ref().map(format_ts))
        .bind(p.analytics_regime.map(Regime::as_str))
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => {
                let id = done.last_insert_rowid();
                debug!(id, timestamp = %p.timestamp, regime = %p.predicted_regime, "Prediction stored");
                Ok(InsertOutcome::Inserted(id))
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                let err = RegimeError::DuplicatePrediction(p.timestamp);
                warn!(error = %err, "Skipping duplicate cycle write");
                Ok(InsertOutcome::Duplicate)
            }
            Err(e) => Err(anyhow::Error::new(e).context("Failed to insert prediction")),
        }
    }

    pub async fn get(&self, id: i64) -> Result<Option<RegimePrediction>> {
        let sql = format!("SELECT {PREDICTION_COLUMNS} FROM regime_predictions WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load prediction")?;
        row.as_ref().map(prediction_from_row).transpose()
    }

    /// Predictions with `from <= timestamp < to`, oldest first.
    pub async fn range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<RegimePrediction>> {
        let sql = format!(
            "SELECT {PREDICTION_COLUMNS} FROM regime_predictions \
             WHERE timestamp >= ? AND timestamp < ? ORDER BY timestamp ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(format_ts(&from))
            .bind(format_ts(&to))
            .fetch_all(&self.pool)
            .await
            .context("Failed to query prediction range")?;
        rows.iter().map(prediction_from_row).collect()
    }

    /// The `limit` most recent predictions, newest first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<RegimePrediction>> {
        let sql = format!(
            "SELECT {PREDICTION_COLUMNS} FROM regime_predictions ORDER BY timestamp DESC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to query recent predictions")?;
        rows.iter().map(prediction_from_row).collect()
    }

    pub async fn latest(&self) -> Result<Option<RegimePrediction>> {
        Ok(self.recent(1).await?.into_iter().next())
    }

    /// Unresolved predictions at least `horizon` old, oldest first.
    pub async fn pending(&self, now: DateTime<Utc>, horizon: Duration) -> Result<Vec<RegimePrediction>> {
        let sql = format!(
            "SELECT {PREDICTION_COLUMNS} FROM regime_predictions \
             WHERE actual_regime IS NULL AND timestamp <= ? ORDER BY timestamp ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(format_ts(&(now - horizon)))
            .fetch_all(&self.pool)
            .await
            .context("Failed to query pending predictions")?;
        rows.iter().map(prediction_from_row).collect()
    }

    /// Earliest prediction at or after `at` whose data was usable.
    pub async fn first_usable_at_or_after(&self, at: DateTime<Utc>) -> Result<Option<RegimePrediction>> {
        let sql = format!(
            "SELECT {PREDICTION_COLUMNS} FROM regime_predictions \
             WHERE timestamp >= ? AND data_quality != ? ORDER BY timestamp ASC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(format_ts(&at))
            .bind(DataQuality::Unavailable.as_str())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query realized prediction")?;
        row.as_ref().map(prediction_from_row).transpose()
    }

    /// Fill the outcome fields of an unresolved prediction.
    ///
    /// Guarded by `actual_regime IS NULL`: returns `false` when the row was
    /// already resolved (or does not exist), leaving it untouched.
    pub async fn resolve(
        &self,
        id: i64,
        actual: Regime,
        outcome_score: f64,
        feedback_at: DateTime<Utc>,
    ) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE regime_predictions \
             SET actual_regime = ?, outcome_score = ?, feedback_timestamp = ? \
             WHERE id = ? AND actual_regime IS NULL",
        )
        .bind(actual.as_str())
        .bind(outcome_score)
        .bind(format_ts(&feedback_at))
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to resolve prediction")?;
        Ok(done.rows_affected() == 1)
    }

    /// Predicted regimes since `since`, newest first.
    pub async fn regimes_since(&self, since: DateTime<Utc>) -> Result<Vec<Regime>> {
        let rows = sqlx::query(
            "SELECT predicted_regime FROM regime_predictions \
             WHERE timestamp >= ? ORDER BY timestamp DESC",
        )
        .bind(format_ts(&since))
        .fetch_all(&self.pool)
        .await
        .context("Failed to query regime distribution")?;
        rows.iter()
            .map(|r| parse_regime(r.try_get("predicted_regime")?))
            .collect()
    }

    /// The `limit` most recent predicted regimes, newest first.
    pub async fn recent_regimes(&self, limit: i64) -> Result<Vec<Regime>> {
        let rows = sqlx::query(
            "SELECT predicted_regime FROM regime_predictions ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query recent regimes")?;
        rows.iter()
            .map(|r| parse_regime(r.try_get("predicted_regime")?))
            .collect()
    }

    /// Resolved predictions since `since`, oldest first.
    pub async fn resolved_since(&self, since: DateTime<Utc>) -> Result<Vec<RegimePrediction>> {
        let sql = format!(
            "SELECT {PREDICTION_COLUMNS} FROM regime_predictions \
             WHERE actual_regime IS NOT NULL AND timestamp >= ? ORDER BY timestamp ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(format_ts(&since))
            .fetch_all(&self.pool)
            .await
            .context("Failed to query resolved predictions")?;
        rows.iter().map(prediction_from_row).collect()
    }

    /// Write the reporting label. Only the rebalance tool calls this.
    pub async fn set_analytics_label(&self, id: i64, label: Regime) -> Result<bool> {
        let done = sqlx::query("UPDATE regime_predictions SET analytics_regime = ? WHERE id = ?")
            .bind(label.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to write analytics label")?;
        Ok(done.rows_affected() == 1)
    }

    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM regime_predictions")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count predictions")?;
        Ok(row.try_get("n")?)
    }

    // -- Events --

    pub async fn insert_event(&self, event: &RegimeChangeEvent) -> Result<i64> {
        let done = sqlx::query(
            "INSERT INTO regime_change_events \
             (timestamp, from_regime, to_regime, confidence, trigger_reason) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(format_ts(&event.timestamp))
        .bind(event.from_regime.as_str())
        .bind(event.to_regime.as_str())
        .bind(event.confidence)
        .bind(&event.trigger_reason)
        .execute(&self.pool)
        .await
        .context("Failed to insert regime change event")?;
        Ok(done.last_insert_rowid())
    }

    /// The `limit` most recent events, newest first.
    pub async fn recent_events(&self, limit: i64) -> Result<Vec<RegimeChangeEvent>> {
        let rows = sqlx::query(
            "SELECT id, timestamp, from_regime, to_regime, confidence, trigger_reason \
             FROM regime_change_events ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query regime change events")?;
        rows.iter().map(event_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) fn sample_prediction(timestamp: DateTime<Utc>, regime: Regime) -> RegimePrediction {
    let mut indicators = IndicatorSnapshot::neutral(timestamp);
    indicators.long_count = 30;
    indicators.short_count = 15;
    indicators.reversal_ratio = 2.0;
    indicators.quality = DataQuality::Fresh;

    RegimePrediction {
        id: None,
        timestamp,
        predicted_regime: regime,
        confidence: 0.72,
        scores: ComponentScores {
            market: 0.301,
            trend: 0.2,
            momentum: -0.1,
            volatility: 0.35,
            breadth: 0.12,
        },
        strategy: Strategy::Ladder,
        model_version: None,
        indicators,
        reasoning: "test".into(),
        actual_regime: None,
        outcome_score: None,
        feedback_timestamp: None,
        analytics_regime: None,
    }
}
