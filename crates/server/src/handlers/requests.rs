//! Batch submission endpoints.
//!
//! Every endpoint accepts a whole batch under one group id and answers 202
//! once the batch is persisted. Outcomes are reported asynchronously through
//! group events.

use crate::engine::BatchReceipt;
use crate::engine::copy::CopyIntent;
use crate::engine::deletion::DeletionIntent;
use crate::engine::storage::StorageIntent;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;

/// Maximum request body size for batch submissions (8 MiB).
const MAX_BATCH_BODY_SIZE: usize = 8 * 1024 * 1024;

/// Batch of files to store.
#[derive(Debug, Deserialize)]
pub struct StorageBatch {
    pub group_id: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expiration: Option<OffsetDateTime>,
    pub requests: Vec<StorageIntent>,
}

/// Batch of owners giving up files.
#[derive(Debug, Deserialize)]
pub struct DeletionBatch {
    pub group_id: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expiration: Option<OffsetDateTime>,
    pub requests: Vec<DeletionIntent>,
}

/// Batch of files to copy.
#[derive(Debug, Deserialize)]
pub struct CopyBatch {
    pub group_id: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expiration: Option<OffsetDateTime>,
    pub requests: Vec<CopyIntent>,
}

/// Batch of files to make available.
#[derive(Debug, Deserialize)]
pub struct CacheBatch {
    pub group_id: String,
    /// How long the files must stay available.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expiration: Option<OffsetDateTime>,
    pub checksums: Vec<String>,
}

async fn read_batch<T: DeserializeOwned>(req: Request) -> ApiResult<T> {
    let body = axum::body::to_bytes(req.into_body(), MAX_BATCH_BODY_SIZE)
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to read body: {e}")))?;
    serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(format!("invalid JSON: {e}")))
}

/// POST /v1/storage-requests - Store a batch of files.
pub async fn submit_storage_requests(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<(StatusCode, Json<BatchReceipt>)> {
    let batch: StorageBatch = read_batch(req).await?;
    let receipt = state
        .engine
        .storage()
        .submit(&batch.group_id, batch.requests, batch.expiration)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

/// POST /v1/deletion-requests - Delete a batch of files on behalf of their owners.
pub async fn submit_deletion_requests(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<(StatusCode, Json<BatchReceipt>)> {
    let batch: DeletionBatch = read_batch(req).await?;
    let receipt = state
        .engine
        .deletion()
        .submit(&batch.group_id, batch.requests, batch.expiration)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

/// POST /v1/copy-requests - Copy a batch of files to other locations.
pub async fn submit_copy_requests(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<(StatusCode, Json<BatchReceipt>)> {
    let batch: CopyBatch = read_batch(req).await?;
    let receipt = state
        .engine
        .copy()
        .submit(&batch.group_id, batch.requests, batch.expiration)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

/// POST /v1/cache-requests - Make a batch of files available.
pub async fn submit_cache_requests(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<(StatusCode, Json<BatchReceipt>)> {
    let batch: CacheBatch = read_batch(req).await?;
    let receipt = state
        .engine
        .cache()
        .submit(&batch.group_id, batch.checksums, batch.expiration)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}
