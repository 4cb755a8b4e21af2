//! API route definitions
//!
//! Everything lives under `/api/v1` except the root `/health` check:
//! - /ingest, /stream - row intake and the live SSE feed
//! - /config/runtime - hot-reloadable gate and aggregation knobs
//! - /analysis/* - bundle history and Markdown export
//! - /preview/top-features - current contributors without triggering
//! - /backends/* - toggles, direct queries, freeze/unfreeze
//! - /session/* - premium session control
//! - /status, /metrics - pipeline state and counters

use axum::{routing::{get, post}, Router};

use super::handlers::{self, ApiState};

/// Create all `/api/v1` routes
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/ingest", post(handlers::ingest_row))
        .route("/stream", get(handlers::stream_events))
        .route("/status", get(handlers::get_status))
        .route("/metrics", get(handlers::get_metrics))
        .route(
            "/config/runtime",
            get(handlers::get_runtime_config).post(handlers::update_runtime_config),
        )
        .route("/analysis/latest", get(handlers::get_latest_analysis))
        .route("/analysis/history", get(handlers::get_analysis_history))
        .route("/analysis/:id", get(handlers::get_analysis))
        .route("/analysis/:id/markdown", get(handlers::get_analysis_markdown))
        .route("/preview/top-features", get(handlers::get_top_features))
        .route("/backends", get(handlers::list_backends))
        .route("/backends/:id/toggle", post(handlers::toggle_backend))
        .route("/backends/:id/analyze", post(handlers::analyze_backend))
        .route("/backends/:id/freeze", post(handlers::freeze_backend))
        .route("/backends/:id/unfreeze", post(handlers::unfreeze_backend))
        .route("/session", get(handlers::get_session))
        .route("/session/extend", post(handlers::extend_session))
        .route("/session/shutdown", post(handlers::shutdown_session))
        .with_state(state)
}

/// Health check at root level
pub fn root_routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .with_state(state)
}
