//! Durable pipeline state.
//!
//! Holds the `RegimeState` singleton together with the diversity monitor
//! status and the feedback overrides it has applied. Components receive the
//! state from a `StateStore` and hand it back; nothing is kept in process
//! globals between cycles.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error, info};

use crate::config::FeedbackConfig;
use crate::engine::diversity::DiversityStatus;
use crate::types::RegimeState;

/// Runtime overrides of `[feedback]` settings applied by remediation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackOverrides {
    pub auto_retrain: Option<bool>,
    pub reason: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl FeedbackOverrides {
    /// Effective `auto_retrain`, the override winning over config.
    pub fn auto_retrain(&self, config: &FeedbackConfig) -> bool {
        self.auto_retrain.unwrap_or(config.auto_retrain)
    }
}

/// Everything that survives a restart apart from the prediction database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    /// Last notified regime. `None` until the first usable cycle.
    pub regime: Option<RegimeState>,
    #[serde(default)]
    pub diversity: DiversityStatus,
    #[serde(default)]
    pub overrides: FeedbackOverrides,
    #[serde(default)]
    pub cycle_count: u64,
    #[serde(default)]
    pub last_cycle_at: Option<DateTime<Utc>>,
}

/// Injected persistence for `PipelineState`.
pub trait StateStore: Send + Sync {
    /// Load the state, or the default state on first start.
    fn load(&self) -> Result<PipelineState>;

    fn save(&self, state: &PipelineState) -> Result<()>;
}

// ---------------------------------------------------------------------------
// JSON file
// ---------------------------------------------------------------------------

pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The state path with `suffix` appended.
    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut p = self.path.clone().into_os_string();
        p.push(suffix);
        PathBuf::from(p)
    }
}

impl StateStore for JsonStateStore {
    fn load(&self) -> Result<PipelineState> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "No saved state found, starting fresh");
            return Ok(PipelineState::default());
        }

        let json = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state from {}", self.path.display()))?;
        let state: PipelineState = match serde_json::from_str(&json) {
            Ok(state) => state,
            Err(e) => {
                let corrupt = self.sibling(".corrupt");
                error!(
                    path = %self.path.display(),
                    moved_to = %corrupt.display(),
                    error = %e,
                    "Unparseable state file set aside, starting fresh"
                );
                std::fs::rename(&self.path, &corrupt)
                    .with_context(|| format!("Failed to move corrupt state to {}", corrupt.display()))?;
                return Ok(PipelineState::default());
            }
        };

        debug!(
            path = %self.path.display(),
            regime = ?state.regime.as_ref().map(|r| r.regime),
            cycle_count = state.cycle_count,
            "State loaded"
        );
        Ok(state)
    }

    fn save(&self, state: &PipelineState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)
            .context("Failed to serialise pipeline state")?;

        let tmp = self.sibling(".tmp");

        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write state to {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to move state into {}", self.path.display()))?;

        debug!(path = %self.path.display(), "State saved");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Process-local store, for tests and dry runs.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<PipelineState>,
}

impl MemoryStateStore {
    pub fn new(state: PipelineState) -> Self {
        Self { inner: Mutex::new(state) }
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<PipelineState> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("state mutex poisoned"))?;
        Ok(guard.clone())
    }

    fn save(&self, state: &PipelineState) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("state mutex poisoned"))?;
        *guard = state.clone();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
