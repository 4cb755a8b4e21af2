//! Runtime configuration endpoints

use axum::extract::State;
use axum::response::Response;
use axum::Json;
use serde::Serialize;
use tracing::warn;

use super::ApiState;
use crate::api::envelope::{ApiErrorResponse, ApiResponse};
use crate::config::{ConfigChange, ConfigError, RuntimeConfig, RuntimeUpdate};

#[derive(Debug, Serialize)]
pub struct RuntimeConfigView {
    #[serde(flatten)]
    pub config: RuntimeConfig,
    /// `min_context` after applying the automatic rule and the window cap.
    pub effective_min_context: usize,
}

impl From<&RuntimeConfig> for RuntimeConfigView {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            effective_min_context: config.effective_min_context(),
            config: config.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RuntimeUpdateResponse {
    pub changes: Vec<ConfigChange>,
    pub config: RuntimeConfigView,
}

/// GET /api/v1/config/runtime - Active runtime configuration
pub async fn get_runtime_config(State(state): State<ApiState>) -> Response {
    let current = state.runtime.load();
    ApiResponse::ok(RuntimeConfigView::from(current.as_ref()))
}

/// POST /api/v1/config/runtime - Apply a partial runtime update
///
/// Validated as a whole; on any error nothing changes. Takes effect before
/// the next ingested row.
pub async fn update_runtime_config(
    State(state): State<ApiState>,
    Json(update): Json<RuntimeUpdate>,
) -> Response {
    match state.runtime.update(&update) {
        Ok(changes) => {
            if !changes.is_empty() {
                if let Err(e) = state.ingest.reconfigure().await {
                    warn!("Runtime config stored but ingest actor not reachable: {}", e);
                }
            }
            let current = state.runtime.load();
            ApiResponse::ok(RuntimeUpdateResponse {
                changes,
                config: RuntimeConfigView::from(current.as_ref()),
            })
        }
        Err(ConfigError::Validation(errors)) => ApiErrorResponse::bad_request(errors.join("; ")),
        Err(e) => ApiErrorResponse::internal(e.to_string()),
    }
}
