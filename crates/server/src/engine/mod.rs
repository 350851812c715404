//! The file request orchestration engine.
//!
//! [`Engine`] owns the collaborators every component needs (request store, location
//! registry, publishers, job runner) and hands out short-lived views for each
//! component: the status arbiter, the group tracker, the scheduler and the four
//! per-kind services. Views borrow the engine, so components can call each other
//! without reference cycles; all shared state lives in the store.

pub mod arbiter;
pub mod cache;
pub mod cache_guard;
pub mod copy;
pub mod deletion;
pub mod events;
pub mod groups;
pub mod jobs;
pub mod lock;
pub mod operator;
pub mod scheduler;
pub mod session;
pub mod storage;

use crate::metrics::{REQUESTS_CREATED, REQUESTS_FAILED, REQUESTS_SUCCEEDED, STALE_WRITE_RETRIES};
use arbiter::{ArbitrationMode, StatusArbiter};
use cache::CacheRequests;
use cache_guard::CacheCapacityGuard;
use copy::CopyRequests;
use deletion::DeletionRequests;
use events::{EngineEvent, EventPublisher};
use futures::future::BoxFuture;
use groups::{GroupTracker, result_backend};
use jobs::JobRunner;
use lock::ClusterLock;
use scheduler::Scheduler;
use serde::Serialize;
use session::{SessionCounter, SessionNotifier};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use storage::StorageRequests;
use stowage_core::config::AppConfig;
use stowage_core::{
    FileRequest, MAX_BATCH_SIZE, NewFileRequest, RequestId, RequestKind, RequestStatus,
};
use stowage_metadata::repos::RequestRepo;
use stowage_metadata::{MetadataError, MetadataStore, RequestPatch};
use stowage_storage::{LocationRegistry, StorageError};
use uuid::Uuid;

/// Engine error type.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid batch: {0}")]
    Invalid(String),

    #[error("denied: {0}")]
    Denied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("request {0} kept changing concurrently")]
    Contention(RequestId),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] stowage_core::Error),
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Successful physical outcome of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Where the file now lives. Empty for deletions.
    pub location_url: String,
    pub file_size: i64,
}

/// Acknowledgment of an accepted batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReceipt {
    pub group_id: String,
    /// Distinct results the group waits for.
    pub expected: usize,
    /// New request rows.
    pub created: usize,
    /// Intents merged into, or retried on, an existing row.
    pub merged: usize,
    /// Intents resolved without a request row.
    pub resolved: usize,
}

impl BatchReceipt {
    pub fn new(group_id: &str, expected: usize) -> Self {
        Self {
            group_id: group_id.to_string(),
            expected,
            ..Self::default()
        }
    }

    pub(crate) fn count(&mut self, admission: Admission) {
        match admission {
            Admission::Created => self.created += 1,
            Admission::Merged => self.merged += 1,
            Admission::Resolved => self.resolved += 1,
        }
    }
}

/// What happened to one submitted intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Created,
    Merged,
    Resolved,
}

/// Number of distinct results a batch produces.
pub(crate) fn expected_results<'a, I>(kind: RequestKind, keys: I) -> usize
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    keys.into_iter()
        .map(|(checksum, backend)| (checksum, result_backend(kind, backend)))
        .collect::<HashSet<_>>()
        .len()
}

/// Outcome of a storage or availability request, as seen by a copy driving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome<'a> {
    /// The file is at this location.
    Done(&'a str),
    /// The stage failed with this cause.
    Failed(&'a str),
}

/// Shared collaborators of the engine components.
pub struct Engine {
    config: Arc<AppConfig>,
    metadata: Arc<dyn MetadataStore>,
    locations: Arc<LocationRegistry>,
    publisher: Arc<dyn EventPublisher>,
    sessions: Arc<dyn SessionNotifier>,
    jobs: Arc<dyn JobRunner>,
    cache_guard: CacheCapacityGuard,
    lock: ClusterLock,
}

impl Engine {
    pub fn new(
        config: Arc<AppConfig>,
        metadata: Arc<dyn MetadataStore>,
        locations: Arc<LocationRegistry>,
        publisher: Arc<dyn EventPublisher>,
        sessions: Arc<dyn SessionNotifier>,
        jobs: Arc<dyn JobRunner>,
    ) -> Self {
        // Unique per process even when node_id is shared.
        let node = config.scheduler.node_id.as_deref().unwrap_or("stowage");
        let holder = format!("{node}-{}", Uuid::new_v4());
        let cache_guard = CacheCapacityGuard::new(config.cache.max_size_bytes);
        let lock = ClusterLock::new(metadata.clone(), holder);
        Self {
            config,
            metadata,
            locations,
            publisher,
            sessions,
            jobs,
            cache_guard,
            lock,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn locations(&self) -> &Arc<LocationRegistry> {
        &self.locations
    }

    pub fn publisher(&self) -> &Arc<dyn EventPublisher> {
        &self.publisher
    }

    pub fn lock(&self) -> &ClusterLock {
        &self.lock
    }

    pub fn cache_guard(&self) -> &CacheCapacityGuard {
        &self.cache_guard
    }

    pub(crate) fn jobs(&self) -> &Arc<dyn JobRunner> {
        &self.jobs
    }

    pub fn arbiter(&self) -> StatusArbiter<'_> {
        StatusArbiter::new(self.metadata.as_ref())
    }

    pub fn groups(&self) -> GroupTracker<'_> {
        GroupTracker::new(self)
    }

    pub fn scheduler(&self) -> Scheduler<'_> {
        Scheduler::new(self)
    }

    pub fn storage(&self) -> StorageRequests<'_> {
        StorageRequests::new(self)
    }

    pub fn deletion(&self) -> DeletionRequests<'_> {
        DeletionRequests::new(self)
    }

    pub fn copy(&self) -> CopyRequests<'_> {
        CopyRequests::new(self)
    }

    pub fn cache(&self) -> CacheRequests<'_> {
        CacheRequests::new(self)
    }

    // =========================================================================
    // Batch admission
    // =========================================================================

    /// Reject a malformed batch before anything is persisted.
    pub(crate) fn check_batch(
        &self,
        kind: RequestKind,
        group_id: &str,
        len: usize,
    ) -> EngineResult<()> {
        let problem = if group_id.trim().is_empty() {
            Some("group id is empty".to_string())
        } else if len == 0 {
            Some("batch is empty".to_string())
        } else if len > MAX_BATCH_SIZE {
            Some(format!("batch holds {len} files, at most {MAX_BATCH_SIZE} allowed"))
        } else {
            None
        };
        match problem {
            Some(reason) => Err(self.deny(group_id, kind, EngineError::Invalid(reason))),
            None => Ok(()),
        }
    }

    /// Publish the DENIED event for `error` and hand the error back.
    pub(crate) fn deny(&self, group_id: &str, kind: RequestKind, error: EngineError) -> EngineError {
        self.groups().denied(group_id, kind, &error.to_string());
        error
    }

    // =========================================================================
    // Outcome routing
    // =========================================================================

    /// Route a physical success to the owning service.
    ///
    /// `expected_job` restricts the update to a request still claimed by that job.
    pub async fn handle_success(
        &self,
        kind: RequestKind,
        request_id: RequestId,
        completion: &Completion,
        expected_job: Option<Uuid>,
    ) -> EngineResult<()> {
        match kind {
            RequestKind::Storage => {
                self.storage()
                    .handle_success(request_id, completion, expected_job)
                    .await
            }
            RequestKind::Deletion => self.deletion().handle_success(request_id, expected_job).await,
            RequestKind::Cache => {
                self.cache()
                    .handle_success(request_id, completion, expected_job)
                    .await
            }
            RequestKind::Copy => self.copy().handle_success(request_id, completion).await,
        }
    }

    /// Route a failure to the owning service.
    pub async fn handle_error(
        &self,
        kind: RequestKind,
        request_id: RequestId,
        cause: &str,
        expected_job: Option<Uuid>,
    ) -> EngineResult<()> {
        match kind {
            RequestKind::Deletion => {
                self.deletion()
                    .handle_error(request_id, cause, expected_job)
                    .await
            }
            _ => self
                .fail_request(request_id, cause, expected_job)
                .await
                .map(|_| ()),
        }
    }

    /// Fail every request of a crashed job that is still claimed by it.
    ///
    /// Requests the job already resolved, or that were reclaimed since, are left alone.
    pub async fn handle_job_crash(
        &self,
        job_id: Uuid,
        kind: RequestKind,
        request_ids: &[RequestId],
    ) -> EngineResult<usize> {
        let cause = format!("Job {job_id} crashed before completing the request.");
        let mut failed = 0;
        for &request_id in request_ids {
            let claimed = self
                .metadata
                .get_request(request_id)
                .await?
                .is_some_and(|r| r.job_id == Some(job_id) && r.status.is_claimed());
            if !claimed {
                continue;
            }
            if let Err(e) = self
                .handle_error(kind, request_id, &cause, Some(job_id))
                .await
            {
                tracing::error!(
                    job_id = %job_id,
                    request_id,
                    error = %e,
                    "Failed to fail request of crashed job"
                );
                continue;
            }
            failed += 1;
        }
        tracing::warn!(job_id = %job_id, kind = %kind, failed, "Handled crashed job");
        Ok(failed)
    }

    // =========================================================================
    // Versioned row helpers
    // =========================================================================

    pub(crate) fn retries(&self) -> u32 {
        self.config.scheduler.stale_write_retries.max(1)
    }

    /// Swallow a lost optimistic-lock race so the caller re-reads and retries.
    pub(crate) fn absorb_conflict(
        &self,
        err: MetadataError,
        request_id: RequestId,
    ) -> EngineResult<()> {
        match err {
            MetadataError::StaleWrite { .. } | MetadataError::NotFound(_) => {
                STALE_WRITE_RETRIES.inc();
                tracing::debug!(request_id, error = %err, "Request changed concurrently, re-reading");
                Ok(())
            }
            other => Err(other.into()),
        }
    }

    /// Current row if it is live and, when `expected_job` is set, still claimed by that job.
    pub(crate) async fn active_request(
        &self,
        request_id: RequestId,
        expected_job: Option<Uuid>,
    ) -> EngineResult<Option<FileRequest>> {
        let Some(current) = self.metadata.get_request(request_id).await? else {
            return Ok(None);
        };
        if current.status == RequestStatus::Error {
            return Ok(None);
        }
        if let Some(job_id) = expected_job
            && (current.job_id != Some(job_id) || !current.status.is_claimed())
        {
            return Ok(None);
        }
        Ok(Some(current))
    }

    /// Delete a live row at its current version. Returns the deleted state.
    pub(crate) async fn take_request(
        &self,
        request_id: RequestId,
        expected_job: Option<Uuid>,
    ) -> EngineResult<Option<FileRequest>> {
        for _ in 0..self.retries() {
            let Some(current) = self.active_request(request_id, expected_job).await? else {
                return Ok(None);
            };
            match self
                .metadata
                .delete_request(request_id, current.version)
                .await
            {
                Ok(()) => return Ok(Some(current)),
                Err(e) => self.absorb_conflict(e, request_id)?,
            }
        }
        Err(EngineError::Contention(request_id))
    }

    /// Apply a patch to the current version of a row.
    ///
    /// `decide` sees the freshly read row and returns the patch, or `None` to leave the
    /// row alone. Returns the row as it was before the applied patch.
    pub(crate) async fn update_request<F>(
        &self,
        request_id: RequestId,
        mut decide: F,
    ) -> EngineResult<Option<FileRequest>>
    where
        F: FnMut(&FileRequest) -> Option<RequestPatch>,
    {
        for _ in 0..self.retries() {
            let Some(current) = self.metadata.get_request(request_id).await? else {
                return Ok(None);
            };
            let Some(patch) = decide(&current) else {
                return Ok(None);
            };
            match self
                .metadata
                .patch_request(request_id, current.version, &patch)
                .await
            {
                Ok(_) => return Ok(Some(current)),
                Err(e) => self.absorb_conflict(e, request_id)?,
            }
        }
        Err(EngineError::Contention(request_id))
    }

    /// Insert a request whose status was already arbitrated.
    pub(crate) async fn insert_request(&self, request: NewFileRequest) -> EngineResult<FileRequest> {
        let created = self.metadata.create_request(&request).await?;
        REQUESTS_CREATED
            .with_label_values(&[created.kind.as_str()])
            .inc();
        self.count_session(&created, None, Some(SessionCounter::for_status(created.status)));
        tracing::debug!(
            request_id = created.id,
            kind = %created.kind,
            checksum = %created.checksum,
            backend = %created.backend,
            status = %created.status,
            "Request created"
        );
        Ok(created)
    }

    /// Admit an intent: reuse `existing` when given, otherwise insert a new row.
    ///
    /// An existing row in ERROR goes back through the arbiter; a live one only
    /// gains the intent's groups and owners. A row that vanished meanwhile is
    /// replaced by a new one.
    pub(crate) async fn admit(
        &self,
        request: NewFileRequest,
        existing: Option<&FileRequest>,
    ) -> EngineResult<Admission> {
        if let Some(existing) = existing {
            let mut merge = RequestPatch::merge(
                request.group_ids.iter().cloned(),
                request.owners.iter().cloned(),
            );
            let applied = if existing.status == RequestStatus::Error {
                merge.force_delete = Some(request.force_delete);
                self.rearbitrate(existing, merge).await?
            } else {
                self.update_request(existing.id, |current| {
                    (current.status != RequestStatus::Error).then(|| merge.clone())
                })
                .await?
                .is_some()
            };
            if applied {
                return Ok(Admission::Merged);
            }
        }

        let status = self
            .arbiter()
            .decide_status(
                (&request).into(),
                RequestStatus::ToDo,
                ArbitrationMode::Admission,
            )
            .await?;
        self.insert_request(request.with_status(status)).await?;
        Ok(Admission::Created)
    }

    /// Send a row in ERROR back through the arbiter, applying `merge` too.
    ///
    /// Returns false when the row is gone or no longer in ERROR.
    pub(crate) async fn rearbitrate(
        &self,
        request: &FileRequest,
        merge: RequestPatch,
    ) -> EngineResult<bool> {
        let status = self
            .arbiter()
            .decide_status(request.into(), RequestStatus::ToDo, ArbitrationMode::Admission)
            .await?;
        let previous = self
            .update_request(request.id, |current| {
                (current.status == RequestStatus::Error).then(|| RequestPatch {
                    status: Some(status),
                    job_id: Some(None),
                    error_cause: Some(None),
                    cache_group_id: Some(None),
                    storage_group_id: Some(None),
                    ..merge.clone()
                })
            })
            .await?;
        let Some(previous) = previous else {
            return Ok(false);
        };
        tracing::info!(
            request_id = previous.id,
            kind = %previous.kind,
            checksum = %previous.checksum,
            status = %status,
            "Request retried"
        );
        self.count_session(
            &previous,
            Some(SessionCounter::Error),
            Some(SessionCounter::for_status(status)),
        );
        Ok(true)
    }

    /// Move a live request to ERROR and report it.
    ///
    /// Requests already in ERROR keep their cause. Returns the request as it was
    /// before failing, or `None` if nothing changed.
    pub(crate) async fn fail_request(
        &self,
        request_id: RequestId,
        cause: &str,
        expected_job: Option<Uuid>,
    ) -> EngineResult<Option<FileRequest>> {
        for _ in 0..self.retries() {
            let Some(current) = self.active_request(request_id, expected_job).await? else {
                return Ok(None);
            };
            match self
                .metadata
                .patch_request(request_id, current.version, &RequestPatch::error(cause))
                .await
            {
                Ok(_) => {
                    tracing::info!(
                        request_id,
                        kind = %current.kind,
                        checksum = %current.checksum,
                        backend = %current.backend,
                        cause,
                        "Request failed"
                    );
                    self.report_failure(&current, cause).await?;
                    return Ok(Some(current));
                }
                Err(e) => self.absorb_conflict(e, request_id)?,
            }
        }
        Err(EngineError::Contention(request_id))
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    /// Record success for every group of a resolved request and notify.
    pub(crate) async fn report_success(
        &self,
        request: &FileRequest,
        result_file: Option<&str>,
    ) -> EngineResult<()> {
        let groups = self.groups();
        for group_id in &request.group_ids {
            groups
                .request_success(
                    group_id,
                    request.kind,
                    &request.checksum,
                    &request.backend,
                    &request.owners,
                    result_file,
                )
                .await?;
        }
        self.publisher.publish(EngineEvent::FileSuccess {
            kind: request.kind,
            checksum: request.checksum.clone(),
            backend: request.backend.clone(),
            group_ids: request.group_ids.iter().cloned().collect(),
            result_file: result_file.map(str::to_string),
        });
        session::transition(
            self.sessions.as_ref(),
            request,
            Some(SessionCounter::for_status(request.status)),
            Some(SessionCounter::Success),
        );
        REQUESTS_SUCCEEDED
            .with_label_values(&[request.kind.as_str()])
            .inc();

        let location = result_file.unwrap_or_default();
        for group_id in &request.group_ids {
            self.stage_outcome(
                request.kind,
                group_id,
                &request.checksum,
                StageOutcome::Done(location),
            )
            .await?;
        }
        Ok(())
    }

    /// Record an error for every group of a failed request and notify.
    pub(crate) async fn report_failure(
        &self,
        request: &FileRequest,
        cause: &str,
    ) -> EngineResult<()> {
        let groups = self.groups();
        for group_id in &request.group_ids {
            groups
                .request_error(
                    group_id,
                    request.kind,
                    &request.checksum,
                    &request.backend,
                    &request.owners,
                    cause,
                )
                .await?;
        }
        self.publisher.publish(EngineEvent::FileError {
            kind: request.kind,
            checksum: request.checksum.clone(),
            backend: request.backend.clone(),
            group_ids: request.group_ids.iter().cloned().collect(),
            cause: cause.to_string(),
        });
        session::transition(
            self.sessions.as_ref(),
            request,
            Some(SessionCounter::for_status(request.status)),
            Some(SessionCounter::Error),
        );
        REQUESTS_FAILED
            .with_label_values(&[request.kind.as_str()])
            .inc();

        for group_id in &request.group_ids {
            self.stage_outcome(
                request.kind,
                group_id,
                &request.checksum,
                StageOutcome::Failed(cause),
            )
            .await?;
        }
        Ok(())
    }

    /// Report a file resolved without ever having a request row.
    pub(crate) async fn resolve_immediately(
        &self,
        kind: RequestKind,
        group_id: &str,
        checksum: &str,
        backend: &str,
        owners: &BTreeSet<String>,
        outcome: StageOutcome<'_>,
    ) -> EngineResult<()> {
        let groups = self.groups();
        match outcome {
            StageOutcome::Done(location) => {
                let result_file = (!location.is_empty()).then_some(location);
                groups
                    .request_success(group_id, kind, checksum, backend, owners, result_file)
                    .await?;
                self.publisher.publish(EngineEvent::FileSuccess {
                    kind,
                    checksum: checksum.to_string(),
                    backend: backend.to_string(),
                    group_ids: vec![group_id.to_string()],
                    result_file: result_file.map(str::to_string),
                });
                REQUESTS_SUCCEEDED.with_label_values(&[kind.as_str()]).inc();
            }
            StageOutcome::Failed(cause) => {
                groups
                    .request_error(group_id, kind, checksum, backend, owners, cause)
                    .await?;
                self.publisher.publish(EngineEvent::FileError {
                    kind,
                    checksum: checksum.to_string(),
                    backend: backend.to_string(),
                    group_ids: vec![group_id.to_string()],
                    cause: cause.to_string(),
                });
                REQUESTS_FAILED.with_label_values(&[kind.as_str()]).inc();
            }
        }
        tracing::debug!(group_id, kind = %kind, checksum, backend, ?outcome, "Resolved without request");
        self.stage_outcome(kind, group_id, checksum, outcome).await
    }

    /// Session accounting for a newly created or removed row.
    pub(crate) fn count_session(
        &self,
        request: &FileRequest,
        from: Option<SessionCounter>,
        to: Option<SessionCounter>,
    ) {
        session::transition(self.sessions.as_ref(), request, from, to);
    }

    /// Let the copy service react to the outcome of one of its stage requests.
    ///
    /// Boxed: a copy stage outcome can start the next stage, whose immediate
    /// outcome comes back here.
    pub(crate) fn stage_outcome<'a>(
        &'a self,
        kind: RequestKind,
        group_id: &'a str,
        checksum: &'a str,
        outcome: StageOutcome<'a>,
    ) -> BoxFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            match kind {
                RequestKind::Cache | RequestKind::Storage => {
                    self.copy()
                        .on_stage_result(kind, group_id, checksum, outcome)
                        .await
                }
                RequestKind::Deletion | RequestKind::Copy => Ok(()),
            }
        })
    }
}
