//! Storage location adapter trait.

use crate::error::StorageResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use stowage_core::{FileRequest, RequestId, StorageType};

/// Outcome of batch preparation.
///
/// Every request handed to a `prepare_for_*` call is expected to appear either in
/// exactly one working subset or in `preparation_errors`.
#[derive(Debug, Default)]
pub struct PreparationResponse {
    /// Adapter-chosen groupings; each subset becomes one job.
    pub working_subsets: Vec<Vec<FileRequest>>,
    /// Per-request preparation failures, keyed by request id.
    pub preparation_errors: HashMap<RequestId, String>,
}

impl PreparationResponse {
    /// Split `requests` into subsets of at most `files_per_job`, keeping id order.
    pub fn chunked(requests: Vec<FileRequest>, files_per_job: usize) -> Self {
        let mut response = Self::default();
        response.push_chunked(requests, files_per_job);
        response
    }

    /// Append `requests` as subsets of at most `files_per_job`.
    pub fn push_chunked(&mut self, requests: Vec<FileRequest>, files_per_job: usize) {
        let size = files_per_job.max(1);
        let mut current = Vec::with_capacity(size.min(requests.len()));
        for request in requests {
            current.push(request);
            if current.len() == size {
                self.working_subsets.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            self.working_subsets.push(current);
        }
    }

    /// Record a preparation failure for one request.
    pub fn reject(&mut self, request: &FileRequest, cause: impl Into<String>) {
        self.preparation_errors.insert(request.id, cause.into());
    }

    /// Number of requests accounted for.
    pub fn len(&self) -> usize {
        self.working_subsets.iter().map(Vec::len).sum::<usize>() + self.preparation_errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a physical operation produced for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    /// The operation succeeded. `location_url` is where the file now lives
    /// (empty for deletions).
    Done { location_url: String, file_size: i64 },
    /// The operation failed with a cause.
    Failed(String),
}

/// Per-request result of a physical operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOperationResult {
    pub request_id: RequestId,
    pub outcome: FileOutcome,
}

impl FileOperationResult {
    pub fn done(request_id: RequestId, location_url: impl Into<String>, file_size: i64) -> Self {
        Self {
            request_id,
            outcome: FileOutcome::Done {
                location_url: location_url.into(),
                file_size,
            },
        }
    }

    pub fn failed(request_id: RequestId, cause: impl Into<String>) -> Self {
        Self {
            request_id,
            outcome: FileOutcome::Failed(cause.into()),
        }
    }
}

/// Adapter for one named storage location.
///
/// Preparation decides how requests are batched into jobs. The physical
/// operations run inside jobs and report one result per request; a request
/// missing from the returned results is treated as failed by the caller.
#[async_trait]
pub trait StorageLocation: Send + Sync + 'static {
    /// Location name, referenced by requests as their backend.
    fn name(&self) -> &str;

    /// Access class of the location.
    fn storage_type(&self) -> StorageType;

    /// Whether restorations from this location are accounted against the internal cache.
    fn is_internal_cache(&self) -> bool;

    /// Maximum number of requests per working subset.
    fn files_per_job(&self) -> usize;

    /// Batch storage requests into working subsets.
    async fn prepare_for_storage(
        &self,
        requests: Vec<FileRequest>,
    ) -> StorageResult<PreparationResponse> {
        Ok(PreparationResponse::chunked(requests, self.files_per_job()))
    }

    /// Batch deletion requests into working subsets.
    async fn prepare_for_deletion(
        &self,
        requests: Vec<FileRequest>,
    ) -> StorageResult<PreparationResponse> {
        Ok(PreparationResponse::chunked(requests, self.files_per_job()))
    }

    /// Batch restoration (cache) requests into working subsets.
    async fn prepare_for_restoration(
        &self,
        requests: Vec<FileRequest>,
    ) -> StorageResult<PreparationResponse> {
        Ok(PreparationResponse::chunked(requests, self.files_per_job()))
    }

    /// Copy each request's `origin_url` into the location.
    async fn store(&self, requests: &[FileRequest]) -> Vec<FileOperationResult>;

    /// Physically remove each request's file (`origin_url` is the stored location).
    async fn delete(&self, requests: &[FileRequest]) -> Vec<FileOperationResult>;

    /// Restore each request's file into `cache_root`.
    async fn restore(&self, requests: &[FileRequest], cache_root: &Path) -> Vec<FileOperationResult>;

    /// Verify the location is reachable.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stowage_core::RequestKind;
    use stowage_core::RequestStatus;
    use std::collections::BTreeSet;
    use time::OffsetDateTime;

    fn request(id: RequestId) -> FileRequest {
        let now = OffsetDateTime::now_utc();
        FileRequest {
            id,
            kind: RequestKind::Storage,
            checksum: format!("c{id}"),
            backend: "disk".to_string(),
            status: RequestStatus::ToDo,
            group_ids: BTreeSet::new(),
            owners: BTreeSet::new(),
            session_owner: String::new(),
            session: String::new(),
            job_id: None,
            error_cause: None,
            file_name: None,
            origin_url: None,
            file_size: 0,
            storage_subdirectory: None,
            force_delete: false,
            expiration_date: None,
            cache_group_id: None,
            storage_group_id: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn chunked_respects_files_per_job() {
        let requests: Vec<_> = (1..=5).map(request).collect();
        let response = PreparationResponse::chunked(requests, 2);
        let sizes: Vec<usize> = response.working_subsets.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(response.working_subsets[0][0].id, 1);
        assert_eq!(response.len(), 5);
    }

    #[test]
    fn chunked_zero_is_treated_as_one() {
        let response = PreparationResponse::chunked(vec![request(1), request(2)], 0);
        assert_eq!(response.working_subsets.len(), 2);
    }

    #[test]
    fn reject_counts_toward_len() {
        let mut response = PreparationResponse::default();
        assert!(response.is_empty());
        response.reject(&request(9), "missing origin");
        assert_eq!(response.len(), 1);
        assert_eq!(response.preparation_errors[&9], "missing origin");
    }
}
