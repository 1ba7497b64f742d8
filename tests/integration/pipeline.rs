//! Full-cycle scenarios: aggregation through persistence, resolution,
//! diversity monitoring and change notification.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use regime_monitor::config::AppConfig;
use regime_monitor::engine::aggregator::Aggregator;
use regime_monitor::engine::cycle::{CycleLock, Pipeline};
use regime_monitor::engine::diversity::{DiversityPhase, DiversityTransition};
use regime_monitor::engine::notifier::ChangeOutcome;
use regime_monitor::storage::artifact::read_artifact;
use regime_monitor::storage::state::{JsonStateStore, MemoryStateStore, PipelineState, StateStore};
use regime_monitor::storage::PredictionStore;
use regime_monitor::types::{DataQuality, Regime, RegimeState};

use crate::mock_feeds::{FlakyStateStore, MockBreadthFeed, MockCountFeed, RecordingNotifier};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    pipeline: Pipeline,
    long: MockCountFeed,
    short: MockCountFeed,
    breadth: MockBreadthFeed,
    notifier: RecordingNotifier,
    dir: PathBuf,
    owns_dir: bool,
}

impl Harness {
    async fn new(feedback: &str) -> Self {
        let dir = temp_dir();
        let store = PredictionStore::in_memory().await.unwrap();
        let mut h = Self::with_store(store, dir, feedback);
        h.owns_dir = true;
        h
    }

    /// Build a pipeline over an existing store and working directory, as a
    /// restarted process would.
    fn with_store(store: PredictionStore, dir: PathBuf, feedback: &str) -> Self {
        let state_store = Box::new(JsonStateStore::new(dir.join("state.json")));
        Self::build(store, dir, feedback, state_store)
    }

    fn build(
        store: PredictionStore,
        dir: PathBuf,
        feedback: &str,
        state_store: Box<dyn StateStore>,
    ) -> Self {
        let config = test_config(&dir, feedback);
        let long = MockCountFeed::new("long_scanner");
        let short = MockCountFeed::new("short_scanner");
        let breadth = MockBreadthFeed::default();
        let notifier = RecordingNotifier::default();

        let aggregator = Aggregator::new(
            config.aggregator.clone(),
            Box::new(long.clone()),
            Box::new(short.clone()),
            Box::new(breadth.clone()),
        );
        let pipeline = Pipeline::new(config, aggregator, store, state_store, Box::new(notifier.clone()));

        Self { pipeline, long, short, breadth, notifier, dir, owns_dir: false }
    }

    /// Publish fresh readings from every source at `at`.
    fn publish(&self, long: f64, short: f64, at: DateTime<Utc>) {
        self.long.set(long, at);
        self.short.set(short, at);
        self.breadth.set_as_of(at);
    }

    fn state(&self) -> PipelineState {
        JsonStateStore::new(self.dir.join("state.json")).load().unwrap()
    }

    fn store(&self) -> &PredictionStore {
        self.pipeline.store()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if self.owns_dir {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }
}

fn temp_dir() -> PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("regime_it_{}", Uuid::new_v4()));
    std::fs::create_dir_all(&p).unwrap();
    p
}

fn test_config(dir: &Path, feedback: &str) -> AppConfig {
    let toml = format!(
        r#"
[pipeline]
name = "REGIME-IT"
cycle_interval_secs = 900
database_path = ":memory:"
state_path = "{state}"
artifact_path = "{artifact}"
lock_path = "{lock}"

[feeds.long_scanner]
kind = "file"
path = "unused_long.json"

[feeds.short_scanner]
kind = "file"
path = "unused_short.json"

[feeds.breadth]
kind = "file"
path = "unused_breadth.json"

[feedback]
{feedback}
"#,
        state = dir.join("state.json").display(),
        artifact = dir.join("market_regime.json").display(),
        lock = dir.join("cycle.lock").display(),
    );
    AppConfig::from_toml(&toml).unwrap()
}

/// 09:15 UTC, on a 15-minute boundary.
fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 15, 0).unwrap()
}

fn slot(n: i64) -> DateTime<Utc> {
    t0() + Duration::minutes(15 * n)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_bullish_counts_classify_strong_uptrend() {
    let h = Harness::new("").await;
    h.publish(45.0, 20.0, slot(0));

    let report = h.pipeline.run_cycle(slot(0)).await.unwrap();
    assert_eq!(report.regime, Regime::StrongUptrend);
    assert_eq!(report.quality, DataQuality::Fresh);
    assert_eq!(report.change, Some(ChangeOutcome::Initialized));
    assert!(report.prediction_id.is_some());

    let stored = h.store().latest().await.unwrap().unwrap();
    assert_eq!(stored.timestamp, slot(0));
    assert_eq!(stored.predicted_regime, Regime::StrongUptrend);
    assert_eq!(stored.indicators.long_count, 45);
    assert_eq!(stored.indicators.short_count, 20);
    assert!((stored.indicators.reversal_ratio - 2.25).abs() < 1e-9);
    assert!(stored.confidence > 0.5 && stored.confidence <= 1.0);

    let artifact = read_artifact(&h.dir.join("market_regime.json")).unwrap().unwrap();
    assert_eq!(artifact.market_regime.regime, Regime::StrongUptrend);
    assert_eq!(artifact.reversal_counts.long, 45);

    // First usable cycle establishes state without announcing anything
    assert!(h.notifier.messages().is_empty());
    assert_eq!(h.state().regime.unwrap().regime, Regime::StrongUptrend);
}

#[tokio::test]
async fn test_bearish_counts_classify_strong_downtrend() {
    let h = Harness::new("").await;
    h.publish(11.0, 46.0, slot(0));

    let report = h.pipeline.run_cycle(slot(0)).await.unwrap();
    assert_eq!(report.regime, Regime::StrongDowntrend);
    assert_eq!(report.quality, DataQuality::Fresh);
}

#[tokio::test]
async fn test_single_change_after_stable_run() {
    let h = Harness::new("").await;
    for n in 0..3 {
        h.publish(45.0, 20.0, slot(n));
        h.pipeline.run_cycle(slot(n)).await.unwrap();
    }
    h.publish(11.0, 46.0, slot(3));
    let report = h.pipeline.run_cycle(slot(3)).await.unwrap();

    match report.change {
        Some(ChangeOutcome::Changed(event)) => {
            assert_eq!(event.from_regime, Regime::StrongUptrend);
            assert_eq!(event.to_regime, Regime::StrongDowntrend);
            assert_eq!(event.timestamp, slot(3));
        }
        other => panic!("expected a regime change, got {other:?}"),
    }

    let events = h.store().recent_events(10).await.unwrap();
    assert_eq!(events.len(), 1);

    let messages = h.notifier.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("strong_downtrend"));
    assert_eq!(h.state().regime.unwrap().regime, Regime::StrongDowntrend);
}

#[tokio::test]
async fn test_change_recorded_when_notifier_fails() {
    let h = Harness::new("").await;
    h.publish(45.0, 20.0, slot(0));
    h.pipeline.run_cycle(slot(0)).await.unwrap();

    h.notifier.set_failing(true);
    h.publish(11.0, 46.0, slot(1));
    let report = h.pipeline.run_cycle(slot(1)).await.unwrap();

    assert!(matches!(report.change, Some(ChangeOutcome::Changed(_))));
    assert_eq!(h.store().recent_events(10).await.unwrap().len(), 1);
    assert_eq!(h.notifier.messages().len(), 1);
    assert_eq!(h.state().regime.unwrap().regime, Regime::StrongDowntrend);
}

#[tokio::test]
async fn test_confirmation_delays_change() {
    let h = Harness::new("confirmations = 2").await;
    h.publish(45.0, 20.0, slot(0));
    h.pipeline.run_cycle(slot(0)).await.unwrap();

    h.publish(11.0, 46.0, slot(1));
    let first = h.pipeline.run_cycle(slot(1)).await.unwrap();
    assert_eq!(
        first.change,
        Some(ChangeOutcome::AwaitingConfirmation { agreeing: 1, needed: 2 })
    );

    h.publish(11.0, 46.0, slot(2));
    let second = h.pipeline.run_cycle(slot(2)).await.unwrap();
    assert!(matches!(second.change, Some(ChangeOutcome::Changed(_))));
    assert_eq!(h.notifier.messages().len(), 1);
}

#[tokio::test]
async fn test_duplicate_slot_is_not_reinserted() {
    let h = Harness::new("").await;
    h.publish(45.0, 20.0, slot(0));
    let first = h.pipeline.run_cycle(slot(0)).await.unwrap();
    assert!(!first.is_duplicate());

    // Same 15-minute slot, different counts
    h.publish(11.0, 46.0, slot(0));
    let second = h.pipeline.run_cycle(slot(0) + Duration::minutes(5)).await.unwrap();
    assert!(second.is_duplicate());
    assert_eq!(second.timestamp, slot(0));
    assert!(second.change.is_none());
    assert!(second.diversity.is_none());

    assert_eq!(h.store().count().await.unwrap(), 1);
    assert_eq!(
        h.store().latest().await.unwrap().unwrap().predicted_regime,
        Regime::StrongUptrend
    );
    assert!(h.store().recent_events(10).await.unwrap().is_empty());
    assert_eq!(h.state().cycle_count, 2);
}

#[tokio::test]
async fn test_outcomes_resolve_once_after_horizon() {
    let h = Harness::new("resolution_horizon_minutes = 30").await;

    let mut resolved = Vec::new();
    for n in 0..4 {
        h.publish(45.0, 20.0, slot(n));
        let report = h.pipeline.run_cycle(slot(n)).await.unwrap();
        resolved.push(report.resolution.resolved);
    }
    // Slot 0 resolves against slot 2, slot 1 against slot 3
    assert_eq!(resolved, vec![0, 0, 1, 1]);

    let all = h.store().range(slot(0), slot(4)).await.unwrap();
    assert!(all[0].is_resolved());
    assert_eq!(all[0].actual_regime, Some(Regime::StrongUptrend));
    assert_eq!(all[0].outcome_score, Some(1.0));
    assert_eq!(all[0].feedback_timestamp, Some(slot(2)));
    assert!(all[1].is_resolved());
    assert!(!all[2].is_resolved());
    assert!(!all[3].is_resolved());

    // A repeat pass in the same slot changes nothing
    let again = h.pipeline.run_cycle(slot(3)).await.unwrap();
    assert!(again.is_duplicate());
    assert_eq!(again.resolution.resolved, 0);
}

#[tokio::test]
async fn test_outage_degrades_to_stale_then_unavailable() {
    let h = Harness::new("").await;
    h.publish(30.0, 15.0, slot(0));
    let fresh = h.pipeline.run_cycle(slot(0)).await.unwrap();
    assert_eq!(fresh.quality, DataQuality::Fresh);

    // Scanner down: the last-known-good count is substituted
    h.long.set_error("scanner offline");
    h.short.set(15.0, slot(1));
    h.breadth.set_as_of(slot(1));
    let stale = h.pipeline.run_cycle(slot(1)).await.unwrap();
    assert_eq!(stale.quality, DataQuality::Stale);
    assert_eq!(stale.regime, Regime::StrongUptrend);
    assert!(stale.confidence < fresh.confidence);
    assert_eq!(stale.change, Some(ChangeOutcome::Unchanged));

    let stored = h.store().latest().await.unwrap().unwrap();
    assert_eq!(stored.indicators.long_count, 30);
    assert!(stored.indicators.stale_sources.iter().any(|s| s == "long_scanner"));
}

#[tokio::test]
async fn test_no_data_on_first_cycle_is_unavailable() {
    let h = Harness::new("").await;
    h.long.set_error("scanner offline");
    h.short.set_error("scanner offline");

    let report = h.pipeline.run_cycle(slot(0)).await.unwrap();
    assert_eq!(report.quality, DataQuality::Unavailable);
    assert_eq!(report.regime, Regime::Choppy);
    assert_eq!(report.change, Some(ChangeOutcome::SkippedUnavailable));
    assert!(report.confidence < 0.5);
    assert!(h.state().regime.is_none());

    // Recovery establishes state from the first usable snapshot
    h.long.clear_error();
    h.short.clear_error();
    h.publish(11.0, 46.0, slot(1));
    let report = h.pipeline.run_cycle(slot(1)).await.unwrap();
    assert_eq!(report.change, Some(ChangeOutcome::Initialized));
    assert!(h.notifier.messages().is_empty());
}

#[tokio::test]
async fn test_monoculture_triggers_remediation() {
    let h = Harness::new(
        "suspect_after_consecutive = 3\nmin_window_samples = 4\nrecovery_cycles = 2",
    )
    .await;

    let mut transitions = Vec::new();
    for n in 0..4 {
        h.publish(45.0, 20.0, slot(n));
        let report = h.pipeline.run_cycle(slot(n)).await.unwrap();
        transitions.push(report.diversity.unwrap());
    }
    assert_eq!(
        transitions,
        vec![
            DiversityTransition::Unchanged,
            DiversityTransition::Unchanged,
            DiversityTransition::Suspected,
            DiversityTransition::Remediate,
        ]
    );

    let state = h.state();
    assert_eq!(state.diversity.phase, DiversityPhase::Remediated);
    assert_eq!(state.diversity.last_remediation, Some(slot(3)));
    assert_eq!(state.overrides.auto_retrain, Some(false));

    let messages = h.notifier.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("diversity collapse"));
}

#[tokio::test]
async fn test_state_survives_restart() {
    let store = PredictionStore::in_memory().await.unwrap();
    let dir = temp_dir();

    {
        let first = Harness::with_store(store.clone(), dir.clone(), "");
        first.publish(45.0, 20.0, slot(0));
        first.pipeline.run_cycle(slot(0)).await.unwrap();
    }

    let restarted = Harness::with_store(store, dir.clone(), "");
    restarted.publish(11.0, 46.0, slot(1));
    let report = restarted.pipeline.run_cycle(slot(1)).await.unwrap();

    assert!(matches!(report.change, Some(ChangeOutcome::Changed(_))));
    assert_eq!(report.cycle_number, 2);
    assert_eq!(restarted.notifier.messages().len(), 1);

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn test_held_lock_skips_cycle() {
    let h = Harness::new("").await;
    h.publish(45.0, 20.0, slot(0));

    let lock_path = h.dir.join("cycle.lock");
    let held = CycleLock::acquire(&lock_path, Duration::minutes(30), Utc::now())
        .unwrap()
        .unwrap();
    assert!(h.pipeline.run_exclusive(Utc::now()).await.unwrap().is_none());
    assert_eq!(h.store().count().await.unwrap(), 0);

    drop(held);
    assert!(h.pipeline.run_exclusive(slot(0)).await.unwrap().is_some());
    assert_eq!(h.store().count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_corrupt_state_file_does_not_stop_cycles() {
    let h = Harness::new("").await;
    std::fs::write(h.dir.join("state.json"), "{\"regime\": [garbage").unwrap();
    h.publish(45.0, 20.0, slot(0));

    let report = h.pipeline.run_cycle(slot(0)).await.unwrap();
    assert!(report.prediction_id.is_some());
    assert_eq!(report.change, Some(ChangeOutcome::Initialized));
    assert_eq!(h.store().count().await.unwrap(), 1);

    assert!(h.dir.join("state.json.corrupt").exists());
    assert_eq!(h.state().cycle_count, 1);
}

#[tokio::test]
async fn test_seeded_state_announces_first_change() {
    let seeded = PipelineState {
        regime: Some(RegimeState {
            regime: Regime::StrongUptrend,
            confidence: 0.8,
            updated_at: slot(-1),
        }),
        ..PipelineState::default()
    };
    let dir = temp_dir();
    let store = PredictionStore::in_memory().await.unwrap();
    let mut h = Harness::build(store, dir, "", Box::new(MemoryStateStore::new(seeded)));
    h.owns_dir = true;

    h.publish(11.0, 46.0, slot(0));
    let report = h.pipeline.run_cycle(slot(0)).await.unwrap();

    assert!(matches!(report.change, Some(ChangeOutcome::Changed(_))));
    assert_eq!(h.notifier.messages().len(), 1);
    // The JSON state file is never touched
    assert!(!h.dir.join("state.json").exists());
}

#[tokio::test]
async fn test_change_not_announced_until_state_saved() {
    let state = FlakyStateStore::default();
    let dir = temp_dir();
    let store = PredictionStore::in_memory().await.unwrap();
    let mut h = Harness::build(store, dir, "", Box::new(state.clone()));
    h.owns_dir = true;

    h.publish(45.0, 20.0, slot(0));
    h.pipeline.run_cycle(slot(0)).await.unwrap();

    state.set_failing(true);
    h.publish(11.0, 46.0, slot(1));
    assert!(h.pipeline.run_cycle(slot(1)).await.is_err());
    assert!(h.notifier.messages().is_empty());
    assert_eq!(state.snapshot().regime.unwrap().regime, Regime::StrongUptrend);

    // The retry adopts the recorded event and announces it once
    state.set_failing(false);
    h.publish(11.0, 46.0, slot(2));
    let report = h.pipeline.run_cycle(slot(2)).await.unwrap();
    match report.change {
        Some(ChangeOutcome::Changed(event)) => assert_eq!(event.timestamp, slot(1)),
        other => panic!("expected the recorded change, got {other:?}"),
    }
    assert_eq!(h.store().recent_events(10).await.unwrap().len(), 1);
    assert_eq!(h.notifier.messages().len(), 1);
    assert_eq!(state.snapshot().regime.unwrap().regime, Regime::StrongDowntrend);
}
