//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (the Telegram token) are referenced by env-var name in the
//! config and resolved at runtime via `std::env::var`.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Utc, Weekday};
use serde::Deserialize;
use std::fs;

use crate::types::RegimeError;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub pipeline: PipelineConfig,
    pub feeds: FeedsConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    /// When set, the `run` loop only cycles inside these hours.
    #[serde(default)]
    pub market_hours: Option<MarketHoursConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    pub name: String,
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_state_path")]
    pub state_path: String,
    #[serde(default = "default_artifact_path")]
    pub artifact_path: String,
    #[serde(default = "default_lock_path")]
    pub lock_path: String,
    /// A lock older than this is considered abandoned.
    #[serde(default = "default_lock_stale")]
    pub lock_stale_secs: u64,
}

fn default_cycle_interval() -> u64 { 900 }
fn default_database_path() -> String { "regime_monitor.db".into() }
fn default_state_path() -> String { "regime_state.json".into() }
fn default_artifact_path() -> String { "market_regime.json".into() }
fn default_lock_path() -> String { "regime_monitor.lock".into() }
fn default_lock_stale() -> u64 { 1800 }

#[derive(Debug, Deserialize, Clone)]
pub struct AggregatorConfig {
    /// Upper cap for long/short ratios; the floor is its reciprocal.
    pub max_ratio: f64,
    /// Readings older than this are treated as stale.
    pub max_staleness_minutes: i64,
    /// Per-source fetch timeout.
    pub fetch_timeout_secs: u64,
    /// Oldest last-known-good reading substituted for a failed source.
    #[serde(default = "default_max_fallback")]
    pub max_fallback_minutes: i64,
}

fn default_max_fallback() -> i64 { 240 }

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_ratio: 10.0,
            max_staleness_minutes: 60,
            fetch_timeout_secs: 10,
            max_fallback_minutes: default_max_fallback(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedsConfig {
    pub long_scanner: FeedLocation,
    pub short_scanner: FeedLocation,
    pub breadth: FeedLocation,
}

/// Where an upstream producer publishes its latest JSON reading.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedLocation {
    Http { url: String },
    File { path: String },
}

/// Feedback-loop options.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FeedbackConfig {
    pub auto_retrain: bool,
    /// Fewer distinct regimes than this in the window counts as monoculture.
    pub min_regime_diversity: usize,
    /// Ceiling for a single regime's share of the window (0–1).
    pub max_single_regime_pct: f64,
    /// Allows the rebalance admin tool to run without `--force`.
    pub force_diversity: bool,
    /// Bypass the trained model and classify with the ladder only.
    pub emergency_mode: bool,
    pub resolution_horizon_minutes: i64,
    pub diversity_window_days: i64,
    /// Identical consecutive predictions before monoculture is suspected.
    pub suspect_after_consecutive: usize,
    /// Balanced cycles needed to leave the remediated state.
    pub recovery_cycles: u32,
    /// Smallest window the diversity check will judge.
    pub min_window_samples: usize,
    /// Consecutive agreeing predictions needed to confirm a regime change.
    pub confirmations: usize,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            auto_retrain: true,
            min_regime_diversity: 2,
            max_single_regime_pct: 0.60,
            force_diversity: false,
            emergency_mode: false,
            resolution_horizon_minutes: 30,
            diversity_window_days: 7,
            suspect_after_consecutive: 6,
            recovery_cycles: 3,
            min_window_samples: 20,
            confirmations: 1,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ModelConfig {
    /// Directory holding `registry.json` and versioned bundles.
    /// Without it the ladder is the only classifier.
    pub models_dir: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AlertsConfig {
    pub telegram_bot_token_env: Option<String>,
    pub telegram_chat_id_env: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self { enabled: false, port: 8090 }
    }
}

/// Trading session in exchange-local time.
#[derive(Debug, Deserialize, Clone)]
pub struct MarketHoursConfig {
    /// "HH:MM"
    pub open: String,
    /// "HH:MM"
    pub close: String,
    /// Exchange offset from UTC in minutes (e.g. 330 for IST).
    pub utc_offset_minutes: i32,
    #[serde(default = "default_true")]
    pub weekdays_only: bool,
}

fn default_true() -> bool { true }

impl MarketHoursConfig {
    /// Whether `now` falls inside the session.
    pub fn is_open(&self, now: DateTime<Utc>) -> Result<bool, RegimeError> {
        let offset = FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .ok_or_else(|| RegimeError::Config(format!("bad utc offset: {}", self.utc_offset_minutes)))?;
        let open = parse_hhmm(&self.open)?;
        let close = parse_hhmm(&self.close)?;
        let local = now.with_timezone(&offset);

        if self.weekdays_only && matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return Ok(false);
        }
        let t = local.time();
        Ok(t >= open && t <= close)
    }
}

fn parse_hhmm(s: &str) -> Result<NaiveTime, RegimeError> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|e| RegimeError::Config(format!("bad time '{s}': {e}")))
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config = Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot operate with.
    pub fn validate(&self) -> Result<(), RegimeError> {
        if !(self.aggregator.max_ratio.is_finite() && self.aggregator.max_ratio > 1.0) {
            return Err(RegimeError::Config("aggregator.max_ratio must be > 1".into()));
        }
        let pct = self.feedback.max_single_regime_pct;
        if !(pct > 0.0 && pct <= 1.0) {
            return Err(RegimeError::Config("feedback.max_single_regime_pct must be in (0, 1]".into()));
        }
        if self.feedback.resolution_horizon_minutes <= 0 {
            return Err(RegimeError::Config("feedback.resolution_horizon_minutes must be positive".into()));
        }
        if self.feedback.diversity_window_days <= 0 {
            return Err(RegimeError::Config("feedback.diversity_window_days must be positive".into()));
        }
        if self.feedback.confirmations == 0 {
            return Err(RegimeError::Config("feedback.confirmations must be at least 1".into()));
        }
        if self.aggregator.max_fallback_minutes < self.aggregator.max_staleness_minutes {
            return Err(RegimeError::Config(
                "aggregator.max_fallback_minutes must be at least max_staleness_minutes".into(),
            ));
        }
        if self.pipeline.cycle_interval_secs == 0 {
            return Err(RegimeError::Config("pipeline.cycle_interval_secs must be positive".into()));
        }
        if let Some(hours) = &self.market_hours {
            parse_hhmm(&hours.open)?;
            parse_hhmm(&hours.close)?;
        }
        Ok(())
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}

#[cfg(test)]
pub(crate) fn sample_toml() -> &'static str {
    r#"
[pipeline]
name = "REGIME-TEST"
cycle_interval_secs = 900

[feeds.long_scanner]
kind = "file"
path = "scans/long.json"

[feeds.short_scanner]
kind = "file"
path = "scans/short.json"

[feeds.breadth]
kind = "http"
url = "http://localhost:9000/breadth"

[feedback]
max_single_regime_pct = 0.55
resolution_horizon_minutes = 45
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_sample_config() {
        let cfg = AppConfig::from_toml(sample_toml()).unwrap();
        assert_eq!(cfg.pipeline.name, "REGIME-TEST");
        assert_eq!(cfg.pipeline.database_path, "regime_monitor.db");
        assert_eq!(cfg.feeds.long_scanner, FeedLocation::File { path: "scans/long.json".into() });
        assert_eq!(cfg.feeds.breadth, FeedLocation::Http { url: "http://localhost:9000/breadth".into() });
        assert_eq!(cfg.feedback.resolution_horizon_minutes, 45);
        assert!((cfg.feedback.max_single_regime_pct - 0.55).abs() < 1e-12);
        // Unset fields fall back to defaults
        assert_eq!(cfg.feedback.diversity_window_days, 7);
        assert!(cfg.feedback.auto_retrain);
        assert!(!cfg.feedback.force_diversity);
        assert_eq!(cfg.aggregator.max_ratio, 10.0);
        assert_eq!(cfg.aggregator.max_fallback_minutes, 240);
        assert!(cfg.model.models_dir.is_none());
        assert!(cfg.market_hours.is_none());
    }

    #[test]
    fn test_feedback_defaults() {
        let fb = FeedbackConfig::default();
        assert_eq!(fb.resolution_horizon_minutes, 30);
        assert_eq!(fb.diversity_window_days, 7);
        assert!((fb.max_single_regime_pct - 0.60).abs() < 1e-12);
        assert!(!fb.emergency_mode);
    }

    #[test]
    fn test_rejects_bad_ratio_cap() {
        let toml = sample_toml().replace("[feedback]", "[aggregator]\nmax_ratio = 0.5\nmax_staleness_minutes = 60\nfetch_timeout_secs = 5\n\n[feedback]");
        assert!(AppConfig::from_toml(&toml).is_err());
    }

    #[test]
    fn test_rejects_bad_pct() {
        let toml = sample_toml().replace("0.55", "1.5");
        assert!(AppConfig::from_toml(&toml).is_err());
    }

    #[test]
    fn test_market_hours() {
        let hours = MarketHoursConfig {
            open: "09:15".into(),
            close: "15:30".into(),
            utc_offset_minutes: 330,
            weekdays_only: true,
        };
        // Monday 2026-10-19 10:00 IST = 04:30 UTC
        let open = Utc.with_ymd_and_hms(2026, 10, 19, 4, 30, 0).unwrap();
        assert!(hours.is_open(open).unwrap());
        // Monday 16:00 IST
        let after = Utc.with_ymd_and_hms(2026, 10, 19, 10, 30, 0).unwrap();
        assert!(!hours.is_open(after).unwrap());
        // Saturday 10:00 IST
        let weekend = Utc.with_ymd_and_hms(2026, 10, 17, 4, 30, 0).unwrap();
        assert!(!hours.is_open(weekend).unwrap());
    }

    #[test]
    fn test_market_hours_bad_time() {
        let hours = MarketHoursConfig {
            open: "9am".into(),
            close: "15:30".into(),
            utc_offset_minutes: 0,
            weekdays_only: false,
        };
        assert!(hours.is_open(Utc::now()).is_err());
    }
}
