//! Analysis history and feature preview endpoints

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use super::ApiState;
use crate::api::envelope::{ApiErrorResponse, ApiResponse};
use crate::config::defaults::HISTORY_QUERY_LIMIT;

const MAX_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    HISTORY_QUERY_LIMIT
}

/// GET /api/v1/analysis/latest - Most recent bundle
pub async fn get_latest_analysis(State(state): State<ApiState>) -> Response {
    match state.history.latest() {
        Ok(Some(bundle)) => ApiResponse::ok(bundle),
        Ok(None) => ApiErrorResponse::not_found("no analysis has been recorded yet"),
        Err(e) => ApiErrorResponse::internal(e.to_string()),
    }
}

/// GET /api/v1/analysis/history?limit=N - Recent bundle summaries, newest first
pub async fn get_analysis_history(
    State(state): State<ApiState>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let limit = query.limit.clamp(1, MAX_HISTORY_LIMIT);
    match state.history.recent(limit) {
        Ok(bundles) => {
            let summaries: Vec<_> = bundles.iter().map(|b| b.summary()).collect();
            ApiResponse::ok(summaries)
        }
        Err(e) => ApiErrorResponse::internal(e.to_string()),
    }
}

/// GET /api/v1/analysis/:id - Full bundle
pub async fn get_analysis(State(state): State<ApiState>, Path(id): Path<u64>) -> Response {
    match state.history.get(id) {
        Ok(Some(bundle)) => ApiResponse::ok(bundle),
        Ok(None) => ApiErrorResponse::not_found(format!("analysis {id} not found")),
        Err(e) => ApiErrorResponse::internal(e.to_string()),
    }
}

/// GET /api/v1/analysis/:id/markdown - Bundle rendered as Markdown
pub async fn get_analysis_markdown(
    State(state): State<ApiState>,
    Path(id): Path<u64>,
) -> Response {
    match state.history.get(id) {
        Ok(Some(bundle)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
            bundle.to_markdown(),
        )
            .into_response(),
        Ok(None) => ApiErrorResponse::not_found(format!("analysis {id} not found")),
        Err(e) => ApiErrorResponse::internal(e.to_string()),
    }
}

/// GET /api/v1/preview/top-features - Current top contributors, no side effects
pub async fn get_top_features(State(state): State<ApiState>) -> Response {
    match state.ingest.preview().await {
        Ok(preview) => ApiResponse::ok(preview),
        Err(e) => ApiErrorResponse::service_unavailable(e.to_string()),
    }
}
