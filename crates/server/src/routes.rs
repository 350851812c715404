//! Route configuration.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::routing::{delete, get, post};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        // Health check (load balancers/k8s probes)
        .route("/v1/health", get(handlers::health_check))
        // Batch submission
        .route(
            "/v1/storage-requests",
            post(handlers::submit_storage_requests),
        )
        .route(
            "/v1/deletion-requests",
            post(handlers::submit_deletion_requests),
        )
        .route("/v1/copy-requests", post(handlers::submit_copy_requests))
        .route("/v1/cache-requests", post(handlers::submit_cache_requests))
        // Group actions
        .route("/v1/groups/{group_id}/retry", post(handlers::retry_group))
        .route("/v1/groups/{group_id}/cancel", post(handlers::cancel_group))
        .route("/v1/requests/retry", post(handlers::retry_owners))
        // Operator endpoints
        .route("/v1/admin/stop/{kind}", post(handlers::stop_pending))
        .route(
            "/v1/admin/backends/{backend}/requests",
            delete(handlers::purge_backend_requests),
        )
        .route("/v1/admin/requests/stats", get(handlers::request_stats));

    let mut router = Router::new().merge(api_routes);

    // Restrict /metrics to scraper networks at the infrastructure level.
    if state.config.server.metrics_enabled {
        let metrics_routes = Router::new().route("/metrics", get(metrics_handler));
        router = router.merge(metrics_routes);
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
