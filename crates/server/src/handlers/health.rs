//! Health check handler.

use crate::error::ApiResult;
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use serde::Serialize;

/// Health check response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    /// Storage backend name.
    pub backend: &'static str,
    /// Sessions held in the registry, in any state.
    pub sessions: usize,
}

/// GET /v1/health - Health check.
///
/// Unauthenticated, for load balancers and liveness probes. Fails with 500
/// when the storage root is not writable.
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    state.storage.health_check().await?;

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        backend: state.storage.backend_name(),
        sessions: state.sessions.len(),
    }))
}
