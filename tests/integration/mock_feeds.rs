//! Mock indicator feeds for integration testing.
//!
//! Deterministic `IndicatorFeed` implementations whose readings and
//! failures are controlled from test code, a notifier that records every
//! message it is asked to send, and a state store whose saves can fail.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

use regime_monitor::data::{BreadthReading, IndicatorFeed, ReversalCount};
use regime_monitor::notify::Notifier;
use regime_monitor::storage::state::{MemoryStateStore, PipelineState, StateStore};
use regime_monitor::types::RegimeError;

/// A reversal scanner whose count is set by the test.
///
/// Clones share state, so a test keeps one handle while the aggregator
/// owns the other.
#[derive(Clone)]
pub struct MockCountFeed {
    name: &'static str,
    reading: Arc<Mutex<Option<ReversalCount>>>,
    /// If set, `fetch` returns this error.
    force_error: Arc<Mutex<Option<String>>>,
}

impl MockCountFeed {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            reading: Arc::new(Mutex::new(None)),
            force_error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set(&self, count: f64, as_of: DateTime<Utc>) {
        *self.reading.lock().unwrap() = Some(ReversalCount { count, as_of });
    }

    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn clear_error(&self) {
        *self.force_error.lock().unwrap() = None;
    }
}

#[async_trait]
impl IndicatorFeed<ReversalCount> for MockCountFeed {
    fn name(&self) -> &str {
        self.name
    }

    async fn fetch(&self) -> Result<ReversalCount> {
        if let Some(msg) = self.force_error.lock().unwrap().as_ref() {
            return Err(anyhow!("{msg}"));
        }
        self.reading
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("{} has not published yet", self.name))
    }
}

/// Breadth service returning a fixed, mildly bullish reading stamped with
/// whatever time the test sets.
#[derive(Clone, Default)]
pub struct MockBreadthFeed {
    as_of: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl MockBreadthFeed {

    pub fn set_as_of(&self, as_of: DateTime<Utc>) {
        *self.as_of.lock().unwrap() = Some(as_of);
    }
}

#[async_trait]
impl IndicatorFeed<BreadthReading> for MockBreadthFeed {
    fn name(&self) -> &str {
        "breadth"
    }

    async fn fetch(&self) -> Result<BreadthReading> {
        let as_of = self
            .as_of
            .lock()
            .unwrap()
            .ok_or_else(|| anyhow!("breadth has not published yet"))?;
        Ok(BreadthReading {
            breadth_20: 58.0,
            breadth_50: 54.0,
            momentum: 0.2,
            trend: 0.25,
            volatility: 0.3,
            as_of,
        })
    }
}

/// Notifier that keeps every message in memory.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    messages: Arc<Mutex<Vec<String>>>,
    fail: Arc<Mutex<bool>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    /// Make every subsequent send fail after recording the attempt.
    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, message: &str) -> Result<(), RegimeError> {
        self.messages.lock().unwrap().push(message.to_string());
        if *self.fail.lock().unwrap() {
            return Err(RegimeError::Notifier {
                notifier: "recording".into(),
                message: "forced failure".into(),
            });
        }
        Ok(())
    }
}

/// In-memory state whose saves fail on demand, as a full disk would.
#[derive(Clone, Default)]
pub struct FlakyStateStore {
    inner: Arc<MemoryStateStore>,
    fail_saves: Arc<Mutex<bool>>,
}

impl FlakyStateStore {
    pub fn set_failing(&self, fail: bool) {
        *self.fail_saves.lock().unwrap() = fail;
    }

    pub fn snapshot(&self) -> PipelineState {
        self.inner.load().unwrap()
    }
}

impl StateStore for FlakyStateStore {
    fn load(&self) -> Result<PipelineState> {
        self.inner.load()
    }

    fn save(&self, state: &PipelineState) -> Result<()> {
        if *self.fail_saves.lock().unwrap() {
            return Err(anyhow!("no space left on device"));
        }
        self.inner.save(state)
    }
}
