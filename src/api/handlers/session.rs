//! Premium session endpoints

use axum::extract::State;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use tokio::time::Instant;

use super::ApiState;
use crate::api::envelope::{ApiErrorResponse, ApiResponse};
use crate::config::defaults::SESSION_MINUTES;
use crate::session::{SessionError, ShutdownReason};

#[derive(Debug, Deserialize)]
pub struct ExtendRequest {
    #[serde(default = "default_extension")]
    pub additional_minutes: u64,
}

fn default_extension() -> u64 {
    SESSION_MINUTES
}

/// GET /api/v1/session - Premium session state
pub async fn get_session(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.session.status(Instant::now()))
}

/// POST /api/v1/session/extend - Add minutes to the running session
pub async fn extend_session(
    State(state): State<ApiState>,
    request: Option<Json<ExtendRequest>>,
) -> Response {
    let minutes = request.map_or_else(default_extension, |Json(r)| r.additional_minutes);
    match state.session.extend(minutes) {
        Ok(status) => ApiResponse::ok(status),
        Err(e @ SessionError::NotActive) => ApiErrorResponse::conflict(e.to_string()),
        Err(e @ SessionError::InvalidExtension { .. }) => ApiErrorResponse::bad_request(e.to_string()),
        Err(e) => ApiErrorResponse::internal(e.to_string()),
    }
}

/// POST /api/v1/session/shutdown - End the session now
pub async fn shutdown_session(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.session.shutdown(ShutdownReason::Manual))
}
