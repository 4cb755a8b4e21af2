//! System state endpoints: health, status, metrics

use axum::extract::State;
use axum::response::Response;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::warn;

use super::ApiState;
use crate::api::envelope::{ApiErrorResponse, ApiResponse};
use crate::broadcast::BroadcastStats;
use crate::llm::BackendStatusView;
use crate::pipeline::IngestMetrics;
use crate::session::SessionStatus;
use crate::types::AnalysisSummary;

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
}

/// GET /health - Liveness check
pub async fn health_check(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
    pub window_len: usize,
    pub window_capacity: usize,
    pub consecutive: u32,
    pub in_flight: bool,
    pub subscribers: usize,
    pub analyses_recorded: usize,
    pub latest_analysis: Option<AnalysisSummary>,
    pub active_backends: Vec<String>,
    pub session: SessionStatus,
}

/// GET /api/v1/status - Compact view of the pipeline and the session
pub async fn get_status(State(state): State<ApiState>) -> Response {
    let metrics = match state.ingest.metrics().await {
        Ok(m) => m,
        Err(e) => return ApiErrorResponse::service_unavailable(e.to_string()),
    };

    let latest_analysis = match state.history.latest() {
        Ok(bundle) => bundle.map(|b| b.summary()),
        Err(e) => {
            warn!("History lookup failed: {}", e);
            None
        }
    };

    ApiResponse::ok(StatusResponse {
        timestamp: Utc::now(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        window_len: metrics.window_len,
        window_capacity: metrics.window_capacity,
        consecutive: metrics.consecutive,
        in_flight: metrics.in_flight,
        subscribers: state.broadcaster.subscriber_count(),
        analyses_recorded: state.history.len(),
        latest_analysis,
        active_backends: state
            .registry
            .active()
            .iter()
            .map(|b| b.id().to_string())
            .collect(),
        session: state.session.status(Instant::now()),
    })
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub ingest: IngestMetrics,
    pub broadcast: BroadcastStats,
    pub backends: Vec<BackendStatusView>,
}

/// GET /api/v1/metrics - Counters for ingestion, gating, streaming and backends
pub async fn get_metrics(State(state): State<ApiState>) -> Response {
    match state.ingest.metrics().await {
        Ok(ingest) => ApiResponse::ok(MetricsResponse {
            ingest,
            broadcast: state.broadcaster.stats(),
            backends: state.registry.statuses(),
        }),
        Err(e) => ApiErrorResponse::service_unavailable(e.to_string()),
    }
}
