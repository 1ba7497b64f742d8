//! Status API route handlers.
//!
//! All endpoints return JSON. State is shared via `Arc<DashboardState>`.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, warn};

use crate::analytics::{CalibrationReport, Calibrator};
use crate::storage::artifact::{read_artifact, DashboardArtifact};
use crate::storage::PredictionStore;
use crate::types::{RegimeChangeEvent, RegimePrediction};

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;
const DEFAULT_ACCURACY_DAYS: i64 = 30;
const MAX_ACCURACY_DAYS: i64 = 365;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Shared state accessible by all route handlers.
pub struct DashboardState {
    pub store: PredictionStore,
    pub artifact_path: PathBuf,
    /// Artifacts older than this are reported as stale.
    pub stale_after_secs: i64,
}

impl DashboardState {
    pub fn new(store: PredictionStore, artifact_path: impl Into<PathBuf>, stale_after_secs: i64) -> Self {
        Self {
            store,
            artifact_path: artifact_path.into(),
            stale_after_secs,
        }
    }
}

pub type AppState = Arc<DashboardState>;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct RegimeResponse {
    /// Last persisted snapshot, `None` before the first cycle.
    pub latest: Option<DashboardArtifact>,
    pub data_age_secs: Option<i64>,
    pub stale: bool,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

impl LimitQuery {
    fn clamped(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Deserialize)]
pub struct AccuracyQuery {
    pub days: Option<i64>,
}

impl AccuracyQuery {
    fn clamped_days(&self) -> i64 {
        self.days.unwrap_or(DEFAULT_ACCURACY_DAYS).clamp(1, MAX_ACCURACY_DAYS)
    }
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /api/regime
pub async fn get_regime(State(state): State<AppState>) -> Json<RegimeResponse> {
    let latest = match read_artifact(&state.artifact_path) {
        Ok(artifact) => artifact,
        Err(e) => {
            warn!(error = %e, "Dashboard artifact unreadable");
            None
        }
    };
    let data_age_secs = latest.as_ref().map(|a| a.age_secs(Utc::now()));
    let stale = data_age_secs.map_or(true, |age| age > state.stale_after_secs);

    Json(RegimeResponse {
        latest,
        data_age_secs,
        stale,
    })
}

/// GET /api/predictions?limit=
pub async fn get_predictions(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<RegimePrediction>>, StatusCode> {
    state.store.recent(query.clamped()).await.map(Json).map_err(|e| {
        error!(error = %e, "Failed to load predictions");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// GET /api/events?limit=
pub async fn get_events(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<RegimeChangeEvent>>, StatusCode> {
    state.store.recent_events(query.clamped()).await.map(Json).map_err(|e| {
        error!(error = %e, "Failed to load regime change events");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// GET /api/accuracy?days=
pub async fn get_accuracy(
    State(state): State<AppState>,
    Query(query): Query<AccuracyQuery>,
) -> Result<Json<CalibrationReport>, StatusCode> {
    let since = Utc::now() - Duration::days(query.clamped_days());
    let resolved = state.store.resolved_since(since).await.map_err(|e| {
        error!(error = %e, "Failed to load resolved predictions");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(Calibrator::from_predictions(&resolved).report()))
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
