//! Shared types for the regime monitor.
//!
//! These types form the data model used across all modules: the regime
//! enum and its directional ladder, indicator snapshots, persisted
//! predictions, change events and the durable regime state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Regime
// ---------------------------------------------------------------------------

/// Discrete market regime, ordered along a directional ladder from the
/// most bearish to the most bullish label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    StrongDowntrend,
    Downtrend,
    ChoppyBearish,
    Choppy,
    ChoppyBullish,
    Uptrend,
    StrongUptrend,
}

impl Regime {
    /// All regimes in ladder order.
    pub const ALL: [Regime; 7] = [
        Regime::StrongDowntrend,
        Regime::Downtrend,
        Regime::ChoppyBearish,
        Regime::Choppy,
        Regime::ChoppyBullish,
        Regime::Uptrend,
        Regime::StrongUptrend,
    ];

    /// The neutral regime used whenever data is missing.
    pub const NEUTRAL: Regime = Regime::Choppy;

    /// Position on the directional ladder (0 = strong_downtrend).
    pub fn rank(self) -> u8 {
        match self {
            Regime::StrongDowntrend => 0,
            Regime::Downtrend => 1,
            Regime::ChoppyBearish => 2,
            Regime::Choppy => 3,
            Regime::ChoppyBullish => 4,
            Regime::Uptrend => 5,
            Regime::StrongUptrend => 6,
        }
    }

    /// Whether two regimes sit next to each other on the ladder.
    pub fn is_adjacent(self, other: Regime) -> bool {
        self.rank().abs_diff(other.rank()) == 1
    }

    /// Graded correctness of a prediction against the realized regime:
    /// 1.0 exact, 0.8 adjacent, 0.0 otherwise.
    pub fn outcome_score(predicted: Regime, actual: Regime) -> f64 {
        if predicted == actual {
            1.0
        } else if predicted.is_adjacent(actual) {
            ADJACENT_CREDIT
        } else {
            0.0
        }
    }

    /// Stable snake_case identifier, used for storage and JSON.
    pub fn as_str(self) -> &'static str {
        match self {
            Regime::StrongDowntrend => "strong_downtrend",
            Regime::Downtrend => "downtrend",
            Regime::ChoppyBearish => "choppy_bearish",
            Regime::Choppy => "choppy",
            Regime::ChoppyBullish => "choppy_bullish",
            Regime::Uptrend => "uptrend",
            Regime::StrongUptrend => "strong_uptrend",
        }
    }

    /// Short emoji marker for notifications.
    pub fn emoji(self) -> &'static str {
        match self {
            Regime::StrongUptrend => "🚀",
            Regime::Uptrend => "📈",
            Regime::ChoppyBullish => "↗️",
            Regime::Choppy => "↔️",
            Regime::ChoppyBearish => "↘️",
            Regime::Downtrend => "📉",
            Regime::StrongDowntrend => "🔻",
        }
    }

    /// Recommended action text attached to change notifications.
    pub fn recommended_action(self) -> &'static str {
        match self {
            Regime::StrongUptrend => "Favour long setups with full size; trail stops rather than take early profits.",
            Regime::Uptrend => "Favour long setups; keep normal position size.",
            Regime::ChoppyBullish => "Selective longs only; reduce size and take profits quickly.",
            Regime::Choppy => "Stay light; trade range edges or wait for a directional break.",
            Regime::ChoppyBearish => "Selective shorts only; tighten stops on existing longs.",
            Regime::Downtrend => "Favour short setups; avoid new longs.",
            Regime::StrongDowntrend => "Defensive stance; short strength and keep exposure minimal.",
        }
    }
}

/// Partial credit for a prediction one ladder step away from the outcome.
pub const ADJACENT_CREDIT: f64 = 0.8;

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for Regime {
    type Err = RegimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace([' ', '-'], "_");
        Regime::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == normalized)
            .ok_or_else(|| RegimeError::MalformedValue {
                field: "regime".into(),
                detail: format!("unknown regime: {s}"),
            })
    }
}

// ---------------------------------------------------------------------------
// Data quality
// ---------------------------------------------------------------------------

/// Freshness of the indicators a snapshot was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataQuality {
    /// Every source answered with current data.
    Fresh,
    /// At least one source was served from last-known-good values.
    Stale,
    /// Reversal counts were missing entirely; the snapshot is neutral.
    Unavailable,
}

impl DataQuality {
    pub fn as_str(self) -> &'static str {
        match self {
            DataQuality::Fresh => "fresh",
            DataQuality::Stale => "stale",
            DataQuality::Unavailable => "unavailable",
        }
    }

    /// Multiplier applied to classifier confidence.
    pub fn confidence_penalty(self) -> f64 {
        match self {
            DataQuality::Fresh => 1.0,
            DataQuality::Stale => 0.8,
            DataQuality::Unavailable => 0.4,
        }
    }
}

impl fmt::Display for DataQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DataQuality {
    type Err = RegimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fresh" => Ok(DataQuality::Fresh),
            "stale" => Ok(DataQuality::Stale),
            "unavailable" => Ok(DataQuality::Unavailable),
            other => Err(RegimeError::MalformedValue {
                field: "data_quality".into(),
                detail: format!("unknown data quality: {other}"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Indicator snapshot
// ---------------------------------------------------------------------------

/// One sanitized set of indicators for a cycle. Every float is finite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub timestamp: DateTime<Utc>,
    pub long_count: u32,
    pub short_count: u32,
    /// long/short, capped to [1/max_ratio, max_ratio]
    pub reversal_ratio: f64,
    /// % of the universe above its 20-day average (0–100)
    pub breadth_20: f64,
    /// % of the universe above its 50-day average (0–100)
    pub breadth_50: f64,
    /// Momentum composite (-1..1)
    pub momentum: f64,
    /// Trend composite (-1..1)
    pub trend: f64,
    /// Volatility composite (0..1)
    pub volatility: f64,
    pub quality: DataQuality,
    /// Sources served from last-known-good values this cycle.
    #[serde(default)]
    pub stale_sources: Vec<String>,
    /// Fields replaced by a sentinel or clamped during sanitization.
    #[serde(default)]
    pub sanitized_fields: Vec<String>,
    /// Production time of each source's reading.
    #[serde(default)]
    pub source_as_of: SourceTimes,
}

/// When each upstream reading was produced. `None` for a source that
/// contributed nothing to the snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceTimes {
    pub long: Option<DateTime<Utc>>,
    pub short: Option<DateTime<Utc>>,
    pub breadth: Option<DateTime<Utc>>,
}

impl IndicatorSnapshot {
    /// Neutral snapshot used when nothing is known.
    pub fn neutral(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            long_count: 0,
            short_count: 0,
            reversal_ratio: 1.0,
            breadth_20: 50.0,
            breadth_50: 50.0,
            momentum: 0.0,
            trend: 0.0,
            volatility: 0.5,
            quality: DataQuality::Unavailable,
            stale_sources: Vec::new(),
            sanitized_fields: Vec::new(),
            source_as_of: SourceTimes::default(),
        }
    }

    /// Whether every numeric field is finite.
    pub fn is_finite(&self) -> bool {
        [
            self.reversal_ratio,
            self.breadth_20,
            self.breadth_50,
            self.momentum,
            self.trend,
            self.volatility,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}

impl fmt::Display for IndicatorSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "long={} short={} ratio={:.2} breadth20={:.0}% breadth50={:.0}% mom={:+.2} trend={:+.2} vol={:.2} [{}]",
            self.long_count,
            self.short_count,
            self.reversal_ratio,
            self.breadth_20,
            self.breadth_50,
            self.momentum,
            self.trend,
            self.volatility,
            self.quality,
        )
    }
}

// ---------------------------------------------------------------------------
// Predictions
// ---------------------------------------------------------------------------

/// Per-component scores behind a classification.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ComponentScores {
    /// Reversal-ratio score (-1..1)
    pub market: f64,
    pub trend: f64,
    pub momentum: f64,
    /// (0..1)
    pub volatility: f64,
    /// Average breadth re-centred on 50% (-1..1)
    pub breadth: f64,
}

/// Which classifier produced a prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Ladder,
    Model,
    /// The trained model could not be loaded; the ladder answered instead.
    LadderFallback,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Ladder => "ladder",
            Strategy::Model => "model",
            Strategy::LadderFallback => "ladder_fallback",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Strategy {
    type Err = RegimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ladder" => Ok(Strategy::Ladder),
            "model" => Ok(Strategy::Model),
            "ladder_fallback" => Ok(Strategy::LadderFallback),
            other => Err(RegimeError::MalformedValue {
                field: "strategy".into(),
                detail: format!("unknown strategy: {other}"),
            }),
        }
    }
}

/// A persisted regime prediction.
///
/// Created once per cycle by the classifier; the three outcome fields are
/// filled exactly once by the resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimePrediction {
    /// Row id, `None` until inserted.
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub predicted_regime: Regime,
    pub confidence: f64,
    pub scores: ComponentScores,
    pub strategy: Strategy,
    pub model_version: Option<String>,
    pub indicators: IndicatorSnapshot,
    pub reasoning: String,
    pub actual_regime: Option<Regime>,
    pub outcome_score: Option<f64>,
    pub feedback_timestamp: Option<DateTime<Utc>>,
    /// Reporting label written only by the rebalance tool.
    pub analytics_regime: Option<Regime>,
}

impl RegimePrediction {
    pub fn is_resolved(&self) -> bool {
        self.actual_regime.is_some()
    }
}

impl fmt::Display for RegimePrediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} conf={:.0}% via {}",
            self.timestamp.format("%Y-%m-%d %H:%M"),
            self.predicted_regime,
            self.confidence * 100.0,
            self.strategy,
        )?;
        if let (Some(actual), Some(score)) = (self.actual_regime, self.outcome_score) {
            write!(f, " → actual={actual} score={score:.1}")?;
        }
        Ok(())
    }
}

/// A confirmed regime transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeChangeEvent {
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub from_regime: Regime,
    pub to_regime: Regime,
    pub confidence: f64,
    pub trigger_reason: String,
}

impl fmt::Display for RegimeChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} → {} (conf={:.0}%): {}",
            self.from_regime,
            self.to_regime,
            self.confidence * 100.0,
            self.trigger_reason,
        )
    }
}

/// The durable "current regime" singleton.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeState {
    pub regime: Regime,
    pub confidence: f64,
    pub updated_at: DateTime<Utc>,
}

/// Clamp a value into [0, 1], mapping NaN to 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain error taxonomy.
///
/// Most variants are recovered where they occur; only `Storage` aborts a
/// cycle.
#[derive(Debug, thiserror::Error)]
pub enum RegimeError {
    #[error("Indicator source unavailable ({source_name}): {message}")]
    DataUnavailable { source_name: String, message: String },

    #[error("Malformed value for {field}: {detail}")]
    MalformedValue { field: String, detail: String },

    #[error("Prediction already recorded for {0}")]
    DuplicatePrediction(DateTime<Utc>),

    #[error("Prediction {0} already resolved")]
    ResolutionRace(i64),

    #[error("Model load failed ({version}): {message}")]
    ModelLoad { version: String, message: String },

    #[error("Diversity collapse: {regime} at {share:.0}% of predictions")]
    DiversityCollapse { regime: Regime, share: f64 },

    #[error("Notifier error ({notifier}): {message}")]
    Notifier { notifier: String, message: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
