//! Row ingestion endpoint

use axum::extract::State;
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::ApiState;
use crate::api::envelope::{ApiErrorResponse, ApiResponse};
use crate::pipeline::IngestAck;
use crate::types::{raw_row_from_json, IngestError};

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub data_point: serde_json::Map<String, serde_json::Value>,
    /// Caller's own row id, echoed back untouched.
    #[serde(default)]
    pub id: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    #[serde(flatten)]
    pub ack: IngestAck,
}

/// POST /api/v1/ingest - Accept one raw row
///
/// Answers as soon as the row has been aggregated, scored and gated; never
/// waits for analysis.
pub async fn ingest_row(
    State(state): State<ApiState>,
    Json(request): Json<IngestRequest>,
) -> Response {
    let row = raw_row_from_json(&request.data_point);
    match state.ingest.ingest(row).await {
        Ok(ack) => ApiResponse::ok(IngestResponse {
            id: request.id,
            ack,
        }),
        Err(e @ IngestError::MissingFeature { .. }) => ApiErrorResponse::unprocessable(e.to_string()),
        Err(IngestError::Unavailable) => {
            ApiErrorResponse::service_unavailable("ingestion is not running")
        }
        Err(e) => ApiErrorResponse::internal(e.to_string()),
    }
}
