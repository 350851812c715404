//! Group and operator endpoints.

use crate::engine::operator::RequestStat;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Query, Request, State};
use serde::{Deserialize, Serialize};
use stowage_core::{RequestKind, RequestStatus};

/// Maximum request body size for operator endpoints (1 MiB).
const MAX_ADMIN_BODY_SIZE: usize = 1024 * 1024;

/// Number of requests an action touched.
#[derive(Debug, Serialize)]
pub struct AffectedResponse {
    pub affected: usize,
}

/// Body of an owner-wide retry.
#[derive(Debug, Deserialize)]
pub struct RetryOwnersRequest {
    pub owners: Vec<String>,
}

/// Query parameters of a backend purge.
#[derive(Debug, Deserialize)]
pub struct PurgeParams {
    pub kind: RequestKind,
    #[serde(default)]
    pub status: Option<RequestStatus>,
}

/// POST /v1/groups/{group_id}/retry - Retry the failed requests of a group.
pub async fn retry_group(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
) -> ApiResult<Json<AffectedResponse>> {
    let affected = state.engine.retry_group(&group_id).await?;
    Ok(Json(AffectedResponse { affected }))
}

/// POST /v1/groups/{group_id}/cancel - Cancel the in-flight requests of a group.
pub async fn cancel_group(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
) -> ApiResult<Json<AffectedResponse>> {
    let affected = state.engine.cancel_group(&group_id).await?;
    Ok(Json(AffectedResponse { affected }))
}

/// POST /v1/requests/retry - Retry the failed requests of some owners.
pub async fn retry_owners(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<Json<AffectedResponse>> {
    let body = axum::body::to_bytes(req.into_body(), MAX_ADMIN_BODY_SIZE)
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to read body: {e}")))?;
    let body: RetryOwnersRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid JSON: {e}")))?;
    if body.owners.is_empty() {
        return Err(ApiError::BadRequest("owners must not be empty".to_string()));
    }

    let affected = state.engine.retry_owners(&body.owners).await?;
    Ok(Json(AffectedResponse { affected }))
}

/// POST /v1/admin/stop/{kind} - Cancel every PENDING request of a kind.
pub async fn stop_pending(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<Json<AffectedResponse>> {
    let kind: RequestKind = kind
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("unknown request kind: {kind}")))?;
    let affected = state.engine.stop_pending(kind).await?;
    Ok(Json(AffectedResponse { affected }))
}

/// DELETE /v1/admin/backends/{backend}/requests - Purge the requests of a backend.
pub async fn purge_backend_requests(
    State(state): State<AppState>,
    Path(backend): Path<String>,
    Query(params): Query<PurgeParams>,
) -> ApiResult<Json<AffectedResponse>> {
    let affected = state
        .engine
        .delete_by_backend(params.kind, &backend, params.status)
        .await?;
    Ok(Json(AffectedResponse { affected }))
}

/// GET /v1/admin/requests/stats - Request counts per kind and status.
pub async fn request_stats(State(state): State<AppState>) -> ApiResult<Json<Vec<RequestStat>>> {
    Ok(Json(state.engine.stats().await?))
}
