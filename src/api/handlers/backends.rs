//! Backend toggles, direct single-backend queries and display control

use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};
use chrono::Utc;
use tracing::{debug, info, warn};

use super::ApiState;
use crate::analysis::{LifecycleError, LifecycleSnapshot};
use crate::api::envelope::{ApiErrorResponse, ApiResponse};
use crate::config::BackendTier;
use crate::llm::{BackendStatusView, RegistryError};
use crate::session::SessionError;
use crate::storage::{DirectEntry, MarkdownJournal};
use crate::types::{BackendId, BackendResult};

#[derive(Debug, Serialize)]
pub struct BackendView {
    #[serde(flatten)]
    pub status: BackendStatusView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<LifecycleSnapshot>,
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct AnalyzeRequest {
    /// Operator context appended to the prompt.
    #[serde(default)]
    pub note: Option<String>,
}

fn lifecycle_error(e: LifecycleError) -> Response {
    match e {
        LifecycleError::Busy { retry_after, .. } => ApiErrorResponse::busy(
            e.to_string(),
            retry_after.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        ),
        LifecycleError::InvalidTransition { .. } => ApiErrorResponse::conflict(e.to_string()),
        LifecycleError::UnknownBackend(_) => ApiErrorResponse::not_found(e.to_string()),
        LifecycleError::Unavailable => ApiErrorResponse::service_unavailable(e.to_string()),
    }
}

/// GET /api/v1/backends - Registry state plus each backend's lifecycle
pub async fn list_backends(State(state): State<ApiState>) -> Response {
    let mut views = Vec::new();
    for status in state.registry.statuses() {
        let lifecycle = match state.lifecycles.get(&status.id) {
            Ok(handle) => handle.status().await.ok(),
            Err(_) => None,
        };
        views.push(BackendView { status, lifecycle });
    }
    ApiResponse::ok(views)
}

/// POST /api/v1/backends/:id/toggle - Switch a backend on or off
pub async fn toggle_backend(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(request): Json<ToggleRequest>,
) -> Response {
    let id = BackendId::new(id);
    match state.session.toggle(&id, request.enabled) {
        Ok(outcome) => ApiResponse::ok(outcome),
        Err(SessionError::Registry(RegistryError::Unknown(name))) => {
            ApiErrorResponse::not_found(format!("unknown backend '{name}'"))
        }
        Err(e) => ApiErrorResponse::internal(e.to_string()),
    }
}

/// POST /api/v1/backends/:id/analyze - Query one backend with the current window
///
/// Bypasses the trigger gate. Answers 429 while the backend is analyzing,
/// displaying or frozen. Hosted backends must be switched on.
pub async fn analyze_backend(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    request: Option<Json<AnalyzeRequest>>,
) -> Response {
    let id = BackendId::new(id);
    let handle = match state.lifecycles.get(&id) {
        Ok(h) => h.clone(),
        Err(e) => return lifecycle_error(e),
    };

    if state.registry.tier(&id) == Some(BackendTier::Hosted)
        && !state.registry.hosted_active().contains(&id)
    {
        return ApiErrorResponse::conflict(format!(
            "hosted backend '{id}' is switched off; toggle it on to start a premium session"
        ));
    }

    let preview = match state.ingest.preview().await {
        Ok(p) => p,
        Err(e) => return ApiErrorResponse::service_unavailable(e.to_string()),
    };
    if preview.window_len == 0 {
        return ApiErrorResponse::conflict("no aggregated rows yet; nothing to analyze");
    }

    let note = request.and_then(|Json(r)| r.note);
    let prompt = state.prompt.request(&preview.comparison, note.as_deref());
    let top_features: Vec<String> = preview.top_features.iter().map(|f| f.name.clone()).collect();

    info!(backend = %id, "🔎 Direct analysis requested");
    match handle.analyze(prompt).await {
        Ok(result) => {
            state.registry.record(std::iter::once(&result));
            if !result.is_success() {
                warn!(backend = %id, status = ?result.status, "Direct analysis failed");
            }
            if let Some(journal) = state.journal.clone() {
                let entry = DirectEntry {
                    timestamp: Utc::now(),
                    top_features: top_features.clone(),
                    note,
                    result: result.clone(),
                };
                log_direct(journal, entry).await;
            }
            ApiResponse::ok(DirectAnalysis { top_features, result })
        }
        Err(e) => lifecycle_error(e),
    }
}

async fn log_direct(journal: MarkdownJournal, entry: DirectEntry) {
    let backend = entry.result.backend_id.clone();
    match tokio::task::spawn_blocking(move || journal.append_direct(&entry)).await {
        Ok(Ok(path)) => debug!(backend = %backend, path = %path.display(), "Direct analysis journaled"),
        Ok(Err(e)) => warn!(backend = %backend, error = %e, "Failed to journal direct analysis"),
        Err(e) => warn!(backend = %backend, error = %e, "Direct journal task failed"),
    }
}

#[derive(Debug, Serialize)]
pub struct DirectAnalysis {
    pub top_features: Vec<String>,
    pub result: BackendResult,
}

/// POST /api/v1/backends/:id/freeze - Keep the displayed result on screen
pub async fn freeze_backend(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    display_control(state, BackendId::new(id), true).await
}

/// POST /api/v1/backends/:id/unfreeze - Release a frozen display
pub async fn unfreeze_backend(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    display_control(state, BackendId::new(id), false).await
}

async fn display_control(state: ApiState, id: BackendId, freeze: bool) -> Response {
    let handle = match state.lifecycles.get(&id) {
        Ok(h) => h.clone(),
        Err(e) => return lifecycle_error(e),
    };
    let outcome = if freeze {
        handle.freeze().await
    } else {
        handle.unfreeze().await
    };
    if let Err(e) = outcome {
        return lifecycle_error(e);
    }
    match handle.status().await {
        Ok(snapshot) => ApiResponse::ok(snapshot),
        Err(e) => lifecycle_error(e),
    }
}
