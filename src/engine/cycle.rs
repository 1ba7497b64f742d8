//! Cycle orchestration.
//!
//! One cycle runs to completion before the next starts:
//! aggregate → classify → persist → artifact → resolve → diversity →
//! save state → notify.
//! A lock file keeps overlapping invocations (cron plus a manual run, say)
//! from writing at the same time.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::aggregator::Aggregator;
use super::diversity::{DiversityMonitor, DiversityPhase, DiversityTransition};
use super::notifier::{ChangeOutcome, RegimeChangeNotifier};
use super::resolver::{OutcomeResolver, ResolutionReport};
use crate::classifier::select_classifier;
use crate::config::AppConfig;
use crate::data::json_feed::JsonFeed;
use crate::notify::{self, Notifier};
use crate::storage::artifact::{write_artifact, DashboardArtifact};
use crate::storage::state::{JsonStateStore, PipelineState, StateStore};
use crate::storage::{InsertOutcome, PredictionStore};
use crate::types::{DataQuality, Regime, RegimePrediction, Strategy};

/// Floor `now` to the start of its cycle slot.
pub fn cycle_timestamp(now: DateTime<Utc>, interval_secs: u64) -> DateTime<Utc> {
    let interval = interval_secs.max(1) as i64;
    let secs = now.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(interval), 0).unwrap_or(now)
}

// ---------------------------------------------------------------------------
// Lock
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    started_at: DateTime<Utc>,
}

/// Single-instance guard. The lock file is removed on drop.
#[derive(Debug)]
pub struct CycleLock {
    path: PathBuf,
}

impl CycleLock {
    /// Take the lock, or `None` when another live run holds it. A lock
    /// older than `stale_after` is assumed abandoned and broken.
    pub fn acquire(path: &Path, stale_after: Duration, now: DateTime<Utc>) -> Result<Option<Self>> {
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let info = LockInfo {
                        pid: std::process::id(),
                        started_at: now,
                    };
                    let json = serde_json::to_string(&info).context("Failed to serialise lock")?;
                    file.write_all(json.as_bytes())
                        .with_context(|| format!("Failed to write lock {}", path.display()))?;
                    return Ok(Some(Self { path: path.to_path_buf() }));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let held_since = lock_started_at(path)?;
                    if now - held_since < stale_after {
                        info!(path = %path.display(), since = %held_since, "Cycle lock held, skipping");
                        return Ok(None);
                    }
                    if !break_stale_lock(path, stale_after, now)? {
                        return Ok(None);
                    }
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to create lock {}", path.display()));
                }
            }
        }
        Ok(None)
    }
}

/// Remove a lock believed stale. Returns `false` when it turned out to be
/// live.
///
/// The lock is first renamed to a private tombstone so that only one
/// contender can take it. If the tombstone is not stale, a newer holder
/// replaced the stale lock between the age check and the rename, and the
/// lock is linked back into place for its owner.
fn break_stale_lock(path: &Path, stale_after: Duration, now: DateTime<Utc>) -> Result<bool> {
    let mut tombstone = path.as_os_str().to_owned();
    tombstone.push(format!(".stale-{}", Uuid::new_v4()));
    let tombstone = PathBuf::from(tombstone);

    match std::fs::rename(path, &tombstone) {
        Ok(()) => {}
        // Another contender broke it first; retry the create
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to move stale lock {}", path.display()));
        }
    }

    let held_since = lock_started_at(&tombstone)?;
    if now - held_since < stale_after {
        info!(path = %path.display(), since = %held_since, "Cycle lock was renewed, restoring it");
        match std::fs::hard_link(&tombstone, path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                warn!(path = %path.display(), "Cycle lock re-created while restoring");
            }
            Err(_) => {
                std::fs::rename(&tombstone, path)
                    .with_context(|| format!("Failed to restore lock {}", path.display()))?;
                return Ok(false);
            }
        }
        let _ = std::fs::remove_file(&tombstone);
        return Ok(false);
    }

    warn!(path = %path.display(), since = %held_since, "Breaking stale cycle lock");
    std::fs::remove_file(&tombstone)
        .with_context(|| format!("Failed to remove stale lock {}", tombstone.display()))?;
    Ok(true)
}

/// When the current holder took the lock. Falls back to the file's mtime
/// when the contents are unreadable.
fn lock_started_at(path: &Path) -> Result<DateTime<Utc>> {
    let parsed = std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<LockInfo>(&raw).ok());
    if let Some(info) = parsed {
        return Ok(info.started_at);
    }
    let modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .with_context(|| format!("Failed to stat lock {}", path.display()))?;
    Ok(DateTime::<Utc>::from(modified))
}

impl Drop for CycleLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Summary of one completed cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub cycle_number: u64,
    pub timestamp: DateTime<Utc>,
    pub regime: Regime,
    pub confidence: f64,
    pub strategy: Strategy,
    pub quality: DataQuality,
    /// `None` when the slot was already recorded.
    pub prediction_id: Option<i64>,
    pub resolution: ResolutionReport,
    pub diversity: Option<DiversityTransition>,
    pub diversity_phase: DiversityPhase,
    pub change: Option<ChangeOutcome>,
}

impl CycleReport {
    pub fn is_duplicate(&self) -> bool {
        self.prediction_id.is_none()
    }
}

pub struct Pipeline {
    config: AppConfig,
    aggregator: Aggregator,
    store: PredictionStore,
    state_store: Box<dyn StateStore>,
    notifier: Box<dyn Notifier>,
    resolver: OutcomeResolver,
    diversity: DiversityMonitor,
    change: RegimeChangeNotifier,
}

impl Pipeline {
    pub fn new(
        config: AppConfig,
        aggregator: Aggregator,
        store: PredictionStore,
        state_store: Box<dyn StateStore>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        let resolver = OutcomeResolver::new(config.feedback.resolution_horizon_minutes);
        let diversity = DiversityMonitor::new(
            config.feedback.clone(),
            config.model.models_dir.as_ref().map(PathBuf::from),
        );
        let change = RegimeChangeNotifier::new(config.feedback.confirmations);
        Self {
            config,
            aggregator,
            store,
            state_store,
            notifier,
            resolver,
            diversity,
            change,
        }
    }

    /// Wire the pipeline from configuration: JSON feeds, the SQLite store,
    /// the JSON state file and the configured notifier.
    pub async fn from_config(config: AppConfig) -> Result<Self> {
        let timeout = config.aggregator.fetch_timeout_secs;
        let aggregator = Aggregator::new(
            config.aggregator.clone(),
            Box::new(JsonFeed::new("long_scanner", config.feeds.long_scanner.clone(), timeout)?),
            Box::new(JsonFeed::new("short_scanner", config.feeds.short_scanner.clone(), timeout)?),
            Box::new(JsonFeed::new("breadth", config.feeds.breadth.clone(), timeout)?),
        );
        let store = PredictionStore::connect(&config.pipeline.database_path).await?;
        let state_store = Box::new(JsonStateStore::new(&config.pipeline.state_path));
        let notifier = notify::from_config(&config.alerts);
        Ok(Self::new(config, aggregator, store, state_store, notifier))
    }

    pub fn store(&self) -> &PredictionStore {
        &self.store
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Run one cycle under the lock. `None` when another run holds it.
    pub async fn run_exclusive(&self, now: DateTime<Utc>) -> Result<Option<CycleReport>> {
        let stale_after = Duration::seconds(self.config.pipeline.lock_stale_secs as i64);
        let Some(_lock) = CycleLock::acquire(Path::new(&self.config.pipeline.lock_path), stale_after, now)? else {
            return Ok(None);
        };
        self.run_cycle(now).await.map(Some)
    }

    /// Run one cycle. Only storage failures propagate.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let cycle_id = Uuid::new_v4();
        let timestamp = cycle_timestamp(now, self.config.pipeline.cycle_interval_secs);
        let mut state = match self.state_store.load() {
            Ok(state) => state,
            Err(e) => {
                error!(cycle_id = %cycle_id, error = %e, "Pipeline state unreadable, continuing from defaults");
                PipelineState::default()
            }
        };
        info!(cycle_id = %cycle_id, cycle = state.cycle_count + 1, slot = %timestamp, "Starting cycle");

        // 1. Aggregate
        let last = self.store.latest().await?;
        let snapshot = self
            .aggregator
            .collect(last.as_ref().map(|p| &p.indicators), timestamp)
            .await;

        // 2. Classify
        let classifier = select_classifier(
            &self.config.feedback,
            self.config.model.models_dir.as_deref(),
            self.aggregator.max_ratio(),
        );
        let c = classifier.classify(&snapshot);

        let mut prediction = RegimePrediction {
            id: None,
            timestamp,
            predicted_regime: c.regime,
            confidence: c.confidence,
            scores: c.scores,
            strategy: c.strategy,
            model_version: c.model_version,
            indicators: snapshot,
            reasoning: c.reasoning,
            actual_regime: None,
            outcome_score: None,
            feedback_timestamp: None,
            analytics_regime: None,
        };

        // 3. Persist
        let prediction_id = match self.store.insert(&prediction).await? {
            InsertOutcome::Inserted(id) => {
                prediction.id = Some(id);
                let artifact = DashboardArtifact::from_prediction(&prediction);
                if let Err(e) = write_artifact(Path::new(&self.config.pipeline.artifact_path), &artifact) {
                    warn!(error = %e, "Failed to write dashboard artifact");
                }
                Some(id)
            }
            InsertOutcome::Duplicate => None,
        };

        // 4. Resolve
        let resolution = self.resolver.resolve_due(&self.store, now).await?;

        // 5-6. Diversity and change notification only follow a new prediction
        let (diversity, change) = if prediction_id.is_some() {
            let (_, transition) = self
                .diversity
                .check(&self.store, &mut state, self.notifier.as_ref(), now)
                .await?;
            let change = self.change.observe(&prediction, &mut state, &self.store).await?;
            (Some(transition), Some(change))
        } else {
            (None, None)
        };

        state.cycle_count += 1;
        state.last_cycle_at = Some(now);
        self.state_store.save(&state)?;

        // 7. Announce, only once the new regime is on disk
        if let Some(change) = &change {
            self.change
                .announce(change, &prediction, self.notifier.as_ref())
                .await;
        }

        let report = CycleReport {
            cycle_id,
            cycle_number: state.cycle_count,
            timestamp,
            regime: prediction.predicted_regime,
            confidence: prediction.confidence,
            strategy: prediction.strategy,
            quality: prediction.indicators.quality,
            prediction_id,
            resolution,
            diversity,
            diversity_phase: state.diversity.phase,
            change,
        };
        log_cycle_report(&report);
        Ok(report)
    }
}

fn log_cycle_report(report: &CycleReport) {
    info!(
        cycle_id = %report.cycle_id,
        cycle = report.cycle_number,
        regime = %report.regime,
        confidence = format!("{:.0}%", report.confidence * 100.0),
        strategy = %report.strategy,
        quality = %report.quality,
        duplicate = report.is_duplicate(),
        resolved = report.resolution.resolved,
        diversity = %report.diversity_phase,
        changed = matches!(report.change, Some(ChangeOutcome::Changed(_))),
        "Cycle complete"
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
