//! File request repository.

use crate::error::MetadataResult;
use async_trait::async_trait;
use stowage_core::{FileRequest, NewFileRequest, RequestId, RequestKind, RequestStatus};
use uuid::Uuid;

/// Partial update applied to one request row.
///
/// `None` leaves a column untouched. `Some(None)` clears a nullable column.
/// Every applied patch increments the row version.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestPatch {
    pub status: Option<RequestStatus>,
    pub job_id: Option<Option<Uuid>>,
    pub error_cause: Option<Option<String>>,
    pub force_delete: Option<bool>,
    pub cache_group_id: Option<Option<String>>,
    pub storage_group_id: Option<Option<String>>,
    pub add_group_ids: Vec<String>,
    pub add_owners: Vec<String>,
}

impl RequestPatch {
    /// Move to `status`, clearing job and error cause.
    pub fn status(status: RequestStatus) -> Self {
        Self {
            status: Some(status),
            job_id: Some(None),
            error_cause: Some(None),
            ..Self::default()
        }
    }

    /// Claim by a job: `PENDING` with the given job id.
    pub fn claimed(job_id: Uuid) -> Self {
        Self {
            status: Some(RequestStatus::Pending),
            job_id: Some(Some(job_id)),
            error_cause: Some(None),
            ..Self::default()
        }
    }

    /// Terminal error with cause. The job reference is dropped.
    pub fn error(cause: impl Into<String>) -> Self {
        Self {
            status: Some(RequestStatus::Error),
            job_id: Some(None),
            error_cause: Some(Some(cause.into())),
            ..Self::default()
        }
    }

    /// Merge group ids and owners without touching the status.
    pub fn merge<G, O>(group_ids: G, owners: O) -> Self
    where
        G: IntoIterator<Item = String>,
        O: IntoIterator<Item = String>,
    {
        Self {
            add_group_ids: group_ids.into_iter().collect(),
            add_owners: owners.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: RequestStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn clearing_error(mut self) -> Self {
        self.error_cause = Some(None);
        self
    }
}

/// Repository for file requests of every kind.
#[async_trait]
pub trait RequestRepo: Send + Sync {
    /// Insert a request with its groups and owners.
    async fn create_request(&self, request: &NewFileRequest) -> MetadataResult<FileRequest>;

    /// Get a request by id.
    async fn get_request(&self, request_id: RequestId) -> MetadataResult<Option<FileRequest>>;

    /// Get several requests by id, ordered by id. Missing ids are skipped.
    async fn get_requests(&self, request_ids: &[RequestId]) -> MetadataResult<Vec<FileRequest>>;

    /// Bulk lookup of the requests of one kind for a set of checksums.
    async fn find_requests_by_checksums(
        &self,
        kind: RequestKind,
        checksums: &[String],
    ) -> MetadataResult<Vec<FileRequest>>;

    /// One scheduler page: requests of `kind` on `backend` in `status` with id > `after_id`,
    /// ordered by id ascending.
    async fn list_requests_page(
        &self,
        kind: RequestKind,
        backend: &str,
        status: RequestStatus,
        after_id: RequestId,
        limit: u32,
    ) -> MetadataResult<Vec<FileRequest>>;

    /// Distinct backends having at least one request of `kind` in `status`.
    async fn list_backends_with_status(
        &self,
        kind: RequestKind,
        status: RequestStatus,
    ) -> MetadataResult<Vec<String>>;

    /// Whether a request of one of `kinds` exists on `checksum` (and `backend` when given)
    /// in one of `statuses`, ignoring `exclude_id`.
    async fn exists_request(
        &self,
        kinds: &[RequestKind],
        checksum: &str,
        backend: Option<&str>,
        statuses: &[RequestStatus],
        exclude_id: Option<RequestId>,
    ) -> MetadataResult<bool>;

    /// Requests referencing a group, optionally restricted to one kind.
    async fn list_requests_by_group(
        &self,
        kind: Option<RequestKind>,
        group_id: &str,
    ) -> MetadataResult<Vec<FileRequest>>;

    /// Requests of `kind` in `status` having at least one of `owners`.
    async fn list_requests_by_owners(
        &self,
        kind: RequestKind,
        owners: &[String],
        status: RequestStatus,
    ) -> MetadataResult<Vec<FileRequest>>;

    /// Requests currently referencing a job.
    async fn list_requests_by_job(&self, job_id: Uuid) -> MetadataResult<Vec<FileRequest>>;

    /// Oldest requests of `kind` in `status`, ordered by id, at most `limit`.
    async fn list_requests_by_status(
        &self,
        kind: RequestKind,
        status: RequestStatus,
        limit: u32,
    ) -> MetadataResult<Vec<FileRequest>>;

    /// Requests of `kind` whose copy stage references `group_id` as cache or storage group.
    async fn find_copy_requests_by_stage_group(
        &self,
        group_id: &str,
    ) -> MetadataResult<Vec<FileRequest>>;

    /// Apply a patch if the row is still at `expected_version`.
    ///
    /// Returns the new version. Fails with `StaleWrite` on a version mismatch and
    /// `NotFound` when the row is gone.
    async fn patch_request(
        &self,
        request_id: RequestId,
        expected_version: i64,
        patch: &RequestPatch,
    ) -> MetadataResult<i64>;

    /// Apply several versioned patches atomically: all succeed or none is applied.
    async fn patch_requests(
        &self,
        patches: &[(RequestId, i64, RequestPatch)],
    ) -> MetadataResult<()>;

    /// Delete a request if it is still at `expected_version`.
    async fn delete_request(&self, request_id: RequestId, expected_version: i64)
    -> MetadataResult<()>;

    /// Delete the requests of `kind` on `backend`, optionally only those in `status`.
    /// Returns the deleted requests.
    async fn delete_requests_by_backend(
        &self,
        kind: RequestKind,
        backend: &str,
        status: Option<RequestStatus>,
    ) -> MetadataResult<Vec<FileRequest>>;

    /// Sum of `file_size` of requests of `kind` in one of `statuses`.
    async fn sum_request_sizes(
        &self,
        kind: RequestKind,
        statuses: &[RequestStatus],
    ) -> MetadataResult<i64>;

    /// Count requests per (kind, status).
    async fn count_requests_by_status(&self) -> MetadataResult<Vec<(String, String, i64)>>;
}
