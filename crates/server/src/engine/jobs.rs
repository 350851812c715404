//! Asynchronous jobs executing working subsets against storage locations.
//!
//! Jobs are persisted when a sweep claims a working subset, then picked up by a
//! dispatch loop which spawns one task per job. Spawned tasks are tracked in a
//! [`JobTaskRegistry`]; a watchdog turns panicked tasks into crashed jobs so their
//! requests are failed instead of staying PENDING forever.

use super::scheduler::{NOT_HANDLED_CAUSE, unknown_location_cause};
use super::{Completion, Engine, EngineError, EngineResult};
use crate::metrics::{JOBS_ACTIVE, JOBS_CRASHED, JOBS_CREATED};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use stowage_core::{FileRequest, RequestId, RequestKind, RequestStatus};
use stowage_metadata::models::JobRow;
use stowage_metadata::repos::{JobRepo, JobState, RequestRepo};
use stowage_metadata::{MetadataStore, RequestPatch};
use stowage_storage::FileOutcome;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Cause recorded on requests whose job was cancelled by an operator.
pub const CANCELLED_CAUSE: &str = "Cancelled by operator.";

/// Upper bound of PENDING requests inspected per kind during startup recovery.
const RECOVERY_SCAN_LIMIT: u32 = 10_000;

/// Persists and cancels jobs.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Persist a queued job for a working subset. Returns `job_id`.
    async fn create_as_queued(
        &self,
        job_id: Uuid,
        kind: RequestKind,
        backend: &str,
        request_ids: &[RequestId],
    ) -> EngineResult<Uuid>;

    /// Abort a job's task if it runs here and mark the job cancelled.
    /// Returns false if the job was already terminal.
    async fn cancel(&self, job_id: Uuid) -> EngineResult<bool>;
}

/// Join handles of the job tasks spawned by this process.
#[derive(Default)]
pub struct JobTaskRegistry {
    tasks: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl JobTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a spawned job task.
    pub async fn register(&self, job_id: Uuid, handle: JoinHandle<()>) {
        self.tasks.lock().await.insert(job_id, handle);
    }

    /// Abort a tracked task. The handle stays registered so the watchdog settles it.
    pub async fn abort(&self, job_id: Uuid) -> bool {
        match self.tasks.lock().await.get(&job_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Remove and return the handles of finished tasks.
    pub async fn take_finished(&self) -> Vec<(Uuid, JoinHandle<()>)> {
        let mut tasks = self.tasks.lock().await;
        let finished: Vec<Uuid> = tasks
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(job_id, _)| *job_id)
            .collect();
        finished
            .into_iter()
            .filter_map(|job_id| tasks.remove(&job_id).map(|handle| (job_id, handle)))
            .collect()
    }

    /// Remove and return every handle, finished or not.
    pub async fn take_all(&self) -> Vec<(Uuid, JoinHandle<()>)> {
        self.tasks.lock().await.drain().collect()
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// [`JobRunner`] persisting jobs in the request store.
pub struct StoreJobRunner {
    metadata: Arc<dyn MetadataStore>,
    tasks: Arc<JobTaskRegistry>,
}

impl StoreJobRunner {
    pub fn new(metadata: Arc<dyn MetadataStore>, tasks: Arc<JobTaskRegistry>) -> Self {
        Self { metadata, tasks }
    }
}

#[async_trait]
impl JobRunner for StoreJobRunner {
    async fn create_as_queued(
        &self,
        job_id: Uuid,
        kind: RequestKind,
        backend: &str,
        request_ids: &[RequestId],
    ) -> EngineResult<Uuid> {
        let payload_json = serde_json::to_string(request_ids)
            .map_err(|e| EngineError::Internal(format!("job payload: {e}")))?;
        let job = JobRow {
            job_id,
            kind: kind.as_str().to_string(),
            backend: backend.to_string(),
            payload_json,
            state: JobState::Queued.as_str().to_string(),
            error: None,
            created_at: OffsetDateTime::now_utc(),
            started_at: None,
            finished_at: None,
        };
        self.metadata.create_job(&job).await?;
        JOBS_CREATED.with_label_values(&[kind.as_str()]).inc();
        tracing::debug!(job_id = %job_id, kind = %kind, backend, requests = request_ids.len(), "Job queued");
        Ok(job_id)
    }

    async fn cancel(&self, job_id: Uuid) -> EngineResult<bool> {
        if self.tasks.abort(job_id).await {
            tracing::info!(job_id = %job_id, "Aborted job task");
        }
        Ok(self
            .metadata
            .transition_job(
                job_id,
                &[JobState::Queued, JobState::Running],
                JobState::Cancelled,
                Some(CANCELLED_CAUSE),
            )
            .await?)
    }
}

/// Claims queued jobs, runs them and watches their tasks.
pub struct JobDispatcher {
    engine: Arc<Engine>,
    tasks: Arc<JobTaskRegistry>,
}

impl JobDispatcher {
    pub fn new(engine: Arc<Engine>, tasks: Arc<JobTaskRegistry>) -> Self {
        Self { engine, tasks }
    }

    /// Claim queued jobs and spawn one task each. Returns the number spawned.
    pub async fn dispatch(&self) -> EngineResult<usize> {
        let limit = self.engine.config().jobs.jobs_per_dispatch;
        let jobs = self.engine.metadata().claim_queued_jobs(limit).await?;
        let count = jobs.len();
        for job in jobs {
            self.spawn(job).await;
        }
        Ok(count)
    }

    async fn spawn(&self, job: JobRow) {
        let job_id = job.job_id;
        let engine = self.engine.clone();
        JOBS_ACTIVE.inc();
        let handle = tokio::spawn(async move {
            let result = execute_job(&engine, &job).await;
            JOBS_ACTIVE.dec();

            let (state, error) = match result {
                Ok(handled) => {
                    tracing::debug!(job_id = %job.job_id, handled, "Job finished");
                    (JobState::Succeeded, None)
                }
                Err(e) => {
                    tracing::error!(job_id = %job.job_id, error = %e, "Job failed");
                    (JobState::Failed, Some(e.to_string()))
                }
            };
            if let Err(e) = engine
                .metadata()
                .transition_job(job.job_id, &[JobState::Running], state, error.as_deref())
                .await
            {
                tracing::error!(job_id = %job.job_id, error = %e, "Failed to record job state");
            }
            if state == JobState::Failed {
                // Requests the job still holds would otherwise stay claimed.
                if let Err(e) = release_failed_job(&engine, &job).await {
                    tracing::error!(job_id = %job.job_id, error = %e, "Failed to release requests of failed job");
                }
            }
        });
        self.tasks.register(job_id, handle).await;
    }

    /// Spawn the periodic dispatch loop.
    pub fn spawn_dispatch_loop(self: Arc<Self>) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.engine.config().jobs.dispatch_interval_secs);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = self.dispatch().await {
                    tracing::error!(error = %e, "Job dispatch failed");
                }
            }
        })
    }

    /// Spawn a watchdog that settles finished tasks and crashes panicked jobs.
    pub fn spawn_watchdog(self: Arc<Self>) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.engine.config().jobs.watchdog_interval_secs);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                self.check_tasks().await;
            }
        })
    }

    /// Settle every finished task. Returns the number of crashed jobs.
    pub async fn check_tasks(&self) -> usize {
        // Handles are taken out under the lock and awaited without it.
        let finished = self.tasks.take_finished().await;
        self.settle(finished).await
    }

    async fn settle(&self, handles: Vec<(Uuid, JoinHandle<()>)>) -> usize {
        let mut crashed = 0;
        for (job_id, handle) in handles {
            match handle.await {
                Ok(()) => {
                    tracing::debug!(job_id = %job_id, "Job task completed");
                }
                Err(join_err) if join_err.is_panic() => {
                    JOBS_ACTIVE.dec();
                    tracing::error!(job_id = %job_id, panic = ?join_err, "Job task panicked");
                    crashed += 1;
                    if let Err(e) = self.crash_job(job_id).await {
                        tracing::error!(job_id = %job_id, error = %e, "Failed to handle crashed job");
                    }
                }
                Err(join_err) if join_err.is_cancelled() => {
                    JOBS_ACTIVE.dec();
                    tracing::warn!(job_id = %job_id, "Job task was cancelled");
                }
                Err(e) => {
                    JOBS_ACTIVE.dec();
                    tracing::error!(job_id = %job_id, error = ?e, "Job task failed with unknown error");
                }
            }
        }
        crashed
    }

    /// Mark a job crashed and fail the requests it still holds.
    pub async fn crash_job(&self, job_id: Uuid) -> EngineResult<usize> {
        let Some(job) = self.engine.metadata().get_job(job_id).await? else {
            return Err(EngineError::NotFound(format!("job {job_id}")));
        };
        let transitioned = self
            .engine
            .metadata()
            .transition_job(
                job_id,
                &[JobState::Queued, JobState::Running],
                JobState::Crashed,
                Some("job terminated abnormally"),
            )
            .await?;
        if transitioned {
            JOBS_CRASHED.inc();
        }
        let kind = job.request_kind()?;
        let request_ids = job.request_ids()?;
        self.engine
            .handle_job_crash(job_id, kind, &request_ids)
            .await
    }

    /// Crash jobs a previous process left running and requests claimed by jobs
    /// that do not exist.
    pub async fn recover_orphans(&self) -> EngineResult<usize> {
        let mut recovered = 0;
        let running = self
            .engine
            .metadata()
            .list_jobs_by_state(JobState::Running)
            .await?;
        for job in running {
            tracing::warn!(job_id = %job.job_id, kind = %job.kind, "Recovering job left running");
            recovered += self.crash_job(job.job_id).await?;
        }

        for kind in [RequestKind::Storage, RequestKind::Deletion, RequestKind::Cache] {
            for status in [RequestStatus::Pending, RequestStatus::Running] {
                let claimed = self
                    .engine
                    .metadata()
                    .list_requests_by_status(kind, status, RECOVERY_SCAN_LIMIT)
                    .await?;
                let mut by_job: BTreeMap<Uuid, Vec<RequestId>> = BTreeMap::new();
                for request in claimed {
                    if let Some(job_id) = request.job_id {
                        by_job.entry(job_id).or_default().push(request.id);
                    }
                }
                for (job_id, request_ids) in by_job {
                    let orphaned = match self.engine.metadata().get_job(job_id).await? {
                        None => true,
                        Some(job) => job.job_state()?.is_terminal(),
                    };
                    if orphaned {
                        tracing::warn!(job_id = %job_id, kind = %kind, requests = request_ids.len(), "Recovering requests of a lost job");
                        recovered += self
                            .engine
                            .handle_job_crash(job_id, kind, &request_ids)
                            .await?;
                    }
                }
            }
        }
        Ok(recovered)
    }

    /// Dispatch and await jobs until none is left queued. Returns the number run.
    ///
    /// Used where sweeps must be observed to completion, such as tests and
    /// one-shot maintenance.
    pub async fn drain(&self) -> EngineResult<usize> {
        let mut total = 0;
        loop {
            let dispatched = self.dispatch().await?;
            let handles = self.tasks.take_all().await;
            let awaited = handles.len();
            self.settle(handles).await;
            total += dispatched;
            if dispatched == 0 && awaited == 0 {
                return Ok(total);
            }
        }
    }
}

async fn release_failed_job(engine: &Engine, job: &JobRow) -> EngineResult<usize> {
    let kind = job.request_kind()?;
    let request_ids = job.request_ids()?;
    engine.handle_job_crash(job.job_id, kind, &request_ids).await
}

/// Run one job: claim its requests, call the adapter and route every outcome.
///
/// Returns the number of requests handled.
pub async fn execute_job(engine: &Engine, job: &JobRow) -> EngineResult<usize> {
    let kind = job.request_kind()?;
    let request_ids = job.request_ids()?;
    let job_id = job.job_id;

    let mut running: Vec<FileRequest> = Vec::with_capacity(request_ids.len());
    for request_id in request_ids {
        let started = engine
            .update_request(request_id, |current| {
                (current.job_id == Some(job_id) && current.status == RequestStatus::Pending).then(
                    || RequestPatch {
                        status: Some(RequestStatus::Running),
                        ..RequestPatch::default()
                    },
                )
            })
            .await?;
        if let Some(mut request) = started {
            request.status = RequestStatus::Running;
            running.push(request);
        }
    }
    if running.is_empty() {
        return Ok(0);
    }

    let Some(location) = engine.locations().get(&job.backend) else {
        for request in &running {
            let cause = unknown_location_cause(&request.checksum, &request.backend);
            engine
                .handle_error(kind, request.id, &cause, Some(job_id))
                .await?;
        }
        return Ok(running.len());
    };

    tracing::info!(job_id = %job_id, kind = %kind, backend = %job.backend, requests = running.len(), "Executing job");
    let results = match kind {
        RequestKind::Storage => location.store(&running).await,
        RequestKind::Deletion => location.delete(&running).await,
        RequestKind::Cache => location.restore(&running, &engine.config().cache.path).await,
        RequestKind::Copy => {
            return Err(EngineError::Internal(
                "copy requests are not executed by jobs".to_string(),
            ));
        }
    };
    let mut outcomes: HashMap<RequestId, FileOutcome> = results
        .into_iter()
        .map(|result| (result.request_id, result.outcome))
        .collect();

    for request in &running {
        let routed = match outcomes.remove(&request.id) {
            Some(FileOutcome::Done {
                location_url,
                file_size,
            }) => {
                let completion = Completion {
                    location_url,
                    file_size,
                };
                engine
                    .handle_success(kind, request.id, &completion, Some(job_id))
                    .await
            }
            Some(FileOutcome::Failed(cause)) => {
                engine
                    .handle_error(kind, request.id, &cause, Some(job_id))
                    .await
            }
            None => {
                engine
                    .handle_error(kind, request.id, NOT_HANDLED_CAUSE, Some(job_id))
                    .await
            }
        };
        if let Err(e) = routed {
            tracing::error!(
                job_id = %job_id,
                request_id = request.id,
                error = %e,
                "Failed to record request outcome"
            );
        }
    }
    Ok(running.len())
}
