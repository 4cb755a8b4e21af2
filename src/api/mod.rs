//! REST API module using Axum
//!
//! JSON endpoints under `/api/v1` with a consistent `{data, meta}` /
//! `{error, meta}` envelope, the live row stream as Server-Sent Events, and a
//! root `/health` check.

pub mod envelope;
pub mod handlers;
mod routes;

pub use handlers::ApiState;

use axum::http::{header, Method};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Ingest rows are small; anything past this is a client bug.
const MAX_BODY_BYTES: usize = 256 * 1024;

const CORS_ENV_VAR: &str = "FAULT_EXPLAINER_CORS_ORIGINS";

/// Build a CORS layer that is restrictive by default (same-origin only).
///
/// Set `FAULT_EXPLAINER_CORS_ORIGINS` to a comma-separated list of allowed
/// origins for a separately served front end.
fn build_cors_layer() -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    match std::env::var(CORS_ENV_VAR) {
        Ok(origins) => {
            let allowed: Vec<_> = origins
                .split(',')
                .filter_map(|o| o.trim().parse().ok())
                .collect();
            tracing::info!(origins = %origins, "CORS: allowing configured origins");
            base.allow_origin(allowed)
        }
        Err(_) => base,
    }
}

/// Create the complete application router.
pub fn create_app(state: ApiState) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes(state.clone()))
        .merge(routes::root_routes(state))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer())
}
