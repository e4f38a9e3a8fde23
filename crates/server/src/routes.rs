//! Route configuration.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

/// Room for multipart boundaries, part headers and the text fields that
/// travel alongside a chunk.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let chunk_body_limit =
        usize::try_from(state.config.server.max_chunk_size).unwrap_or(usize::MAX);

    let mut router = Router::new()
        // Health check (unauthenticated, for load balancers and probes)
        .route("/v1/health", get(handlers::health_check))
        .route(
            "/v1/uploads/chunks",
            post(handlers::upload_chunk).layer(DefaultBodyLimit::max(
                chunk_body_limit.saturating_add(MULTIPART_OVERHEAD),
            )),
        )
        .route("/v1/uploads/{upload_id}", get(handlers::get_upload))
        .route(
            "/v1/uploads/{upload_id}/finalize",
            post(handlers::finalize_upload),
        );

    // SECURITY: When enabled, this endpoint MUST be network-restricted
    // to authorized Prometheus scraper IPs only.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
