//! Status API — read-only Axum server over the prediction store and the
//! dashboard artifact.
//!
//! CORS enabled for local development.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderValue, Method},
    routing::get,
    Router,
};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

pub use routes::{AppState, DashboardState};

/// Serve the API until the task is dropped.
pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind status API port {port}"))?;

    info!(port, "Status API listening on http://localhost:{port}");
    axum::serve(listener, app).await.context("Status API server error")
}

/// Start the API as a background task. Errors are logged.
pub fn spawn_dashboard(state: AppState, port: u16) {
    tokio::spawn(async move {
        if let Err(e) = serve(state, port).await {
            error!(error = %e, "Status API stopped");
        }
    });
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/api/regime", get(routes::get_regime))
        .route("/api/predictions", get(routes::get_predictions))
        .route("/api/events", get(routes::get_events))
        .route("/api/accuracy", get(routes::get_accuracy))
        .route("/health", get(routes::health))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
