//! Dashboard JSON artifact.
//!
//! A single JSON document describing the latest persisted prediction,
//! rewritten after every cycle. Written to a temp file and renamed so that
//! readers never see a partial document.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::types::{DataQuality, Regime, RegimePrediction, Strategy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketRegimeSection {
    pub regime: Regime,
    pub confidence: f64,
    pub strategy: Strategy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendAnalysis {
    pub market_score: f64,
    pub trend_score: f64,
    pub momentum_score: f64,
    pub volatility_score: f64,
    pub breadth_score: f64,
    pub breadth_20: f64,
    pub breadth_50: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReversalCounts {
    pub long: u32,
    pub short: u32,
    pub ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardArtifact {
    pub timestamp: DateTime<Utc>,
    pub market_regime: MarketRegimeSection,
    pub trend_analysis: TrendAnalysis,
    pub reversal_counts: ReversalCounts,
    pub data_quality: DataQuality,
}

impl DashboardArtifact {
    pub fn from_prediction(p: &RegimePrediction) -> Self {
        Self {
            timestamp: p.timestamp,
            market_regime: MarketRegimeSection {
                regime: p.predicted_regime,
                confidence: p.confidence,
                strategy: p.strategy,
            },
            trend_analysis: TrendAnalysis {
                market_score: p.scores.market,
                trend_score: p.scores.trend,
                momentum_score: p.scores.momentum,
                volatility_score: p.scores.volatility,
                breadth_score: p.scores.breadth,
                breadth_20: p.indicators.breadth_20,
                breadth_50: p.indicators.breadth_50,
            },
            reversal_counts: ReversalCounts {
                long: p.indicators.long_count,
                short: p.indicators.short_count,
                ratio: p.indicators.reversal_ratio,
            },
            data_quality: p.indicators.quality,
        }
    }

    /// Seconds between the artifact timestamp and `now`.
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_seconds().max(0)
    }
}

pub fn write_artifact(path: &Path, artifact: &DashboardArtifact) -> Result<()> {
    let json = serde_json::to_string_pretty(artifact)
        .context("Failed to serialise dashboard artifact")?;

    let mut tmp = path.to_path_buf().into_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, json)
        .with_context(|| format!("Failed to write artifact to {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move artifact into {}", path.display()))?;

    debug!(path = %path.display(), regime = %artifact.market_regime.regime, "Artifact written");
    Ok(())
}

/// Read the artifact. `None` if it has never been written.
pub fn read_artifact(path: &Path) -> Result<Option<DashboardArtifact>> {
    if !path.exists() {
        return Ok(None);
    }
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read artifact from {}", path.display()))?;
    let artifact = serde_json::from_str(&json)
        .with_context(|| format!("Failed to parse artifact from {}", path.display()))?;
    Ok(Some(artifact))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
