//! Lock-guarded sweeps turning TO_DO requests into jobs, plus the undelay,
//! group completion and group expiry sweeps.

use super::arbiter::ArbitrationMode;
use super::lock::{EXPIRY_LOCK, GROUPS_LOCK, LockOutcome, UNDELAY_LOCK, sweep_lock_name};
use super::{Engine, EngineError, EngineResult};
use crate::metrics::{STALE_WRITE_RETRIES, SWEEP_DURATION, SWEEPS};
use serde::Serialize;
use std::collections::HashSet;
use std::time::Instant;
use stowage_core::{FileRequest, RequestId, RequestKind, RequestStatus};
use stowage_metadata::repos::RequestRepo;
use stowage_metadata::{MetadataError, RequestPatch};
use stowage_storage::PreparationResponse;
use uuid::Uuid;

/// Cause recorded on requests an adapter neither batched nor rejected.
pub const NOT_HANDLED_CAUSE: &str = "Request has not been handled by storage location adapter.";

/// Cause recorded on requests targeting a location that is not available.
pub fn unknown_location_cause(checksum: &str, backend: &str) -> String {
    format!(
        "File {checksum} cannot be handled as storage location {backend} is unknown or disabled."
    )
}

/// What one scheduling sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub pages: usize,
    /// Requests claimed by a job (or, for copies, started).
    pub scheduled: usize,
    pub jobs: usize,
    pub failed: usize,
    /// Restorations held back by the cache capacity.
    pub deferred: usize,
}

pub struct Scheduler<'a> {
    engine: &'a Engine,
}

impl<'a> Scheduler<'a> {
    pub(crate) fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }

    /// Sweep one request kind if no other process is sweeping it.
    pub async fn run_sweep(&self, kind: RequestKind) -> EngineResult<LockOutcome<SweepReport>> {
        let label = kind.as_str();
        let started = Instant::now();
        let outcome = self
            .engine
            .lock()
            .execute_with_lock(
                sweep_lock_name(kind),
                self.engine.config().scheduler.lock_ttl(),
                || self.sweep(kind),
            )
            .await?;
        if let LockOutcome::Executed(report) = &outcome {
            SWEEPS.with_label_values(&[label]).inc();
            SWEEP_DURATION
                .with_label_values(&[label])
                .observe(started.elapsed().as_secs_f64());
            if report.scheduled + report.failed > 0 {
                tracing::info!(
                    kind = label,
                    pages = report.pages,
                    scheduled = report.scheduled,
                    jobs = report.jobs,
                    failed = report.failed,
                    deferred = report.deferred,
                    "Sweep finished"
                );
            }
        }
        Ok(outcome)
    }

    /// Schedule every TO_DO request of `kind`, backend by backend.
    ///
    /// A backend that fails is logged and skipped; pages already scheduled
    /// for it and for other backends stay committed.
    pub async fn sweep(&self, kind: RequestKind) -> EngineResult<SweepReport> {
        let backends = self
            .engine
            .metadata()
            .list_backends_with_status(kind, RequestStatus::ToDo)
            .await?;
        let mut report = SweepReport::default();
        for backend in backends {
            if let Err(e) = self.sweep_backend(kind, &backend, &mut report).await {
                tracing::error!(kind = %kind, backend, error = %e, "Sweep of storage location failed");
            }
        }
        if kind == RequestKind::Cache {
            self.engine.cache_guard().finish_sweep(report.deferred);
        }
        Ok(report)
    }

    async fn sweep_backend(
        &self,
        kind: RequestKind,
        backend: &str,
        report: &mut SweepReport,
    ) -> EngineResult<()> {
        let page_size = self.engine.config().scheduler.page_size;
        let mut after_id: RequestId = 0;
        loop {
            let page = self
                .engine
                .metadata()
                .list_requests_page(kind, backend, RequestStatus::ToDo, after_id, page_size)
                .await?;
            let Some(last) = page.last() else {
                return Ok(());
            };
            after_id = last.id;
            let full = page.len() >= page_size as usize;
            report.pages += 1;
            self.schedule_page(kind, backend, page, report).await?;
            if !full {
                return Ok(());
            }
        }
    }

    async fn schedule_page(
        &self,
        kind: RequestKind,
        backend: &str,
        page: Vec<FileRequest>,
        report: &mut SweepReport,
    ) -> EngineResult<()> {
        if kind == RequestKind::Copy {
            for copy in &page {
                match self.engine.copy().schedule(copy).await {
                    Ok(true) => report.scheduled += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!(request_id = copy.id, error = %e, "Failed to start copy");
                        self.fail(kind, copy.id, &e.to_string(), report).await;
                    }
                }
            }
            return Ok(());
        }

        let Some(location) = self.engine.locations().get(backend) else {
            tracing::warn!(kind = %kind, backend, requests = page.len(), "Storage location unknown or disabled");
            for request in &page {
                let cause = unknown_location_cause(&request.checksum, &request.backend);
                self.fail(kind, request.id, &cause, report).await;
            }
            return Ok(());
        };

        let page = if kind == RequestKind::Cache && location.is_internal_cache() {
            let offered = page.len();
            let admitted = self
                .engine
                .cache_guard()
                .restorable(
                    self.engine.metadata().as_ref(),
                    self.engine.publisher().as_ref(),
                    page,
                )
                .await?;
            report.deferred += offered - admitted.len();
            admitted
        } else {
            page
        };
        if page.is_empty() {
            return Ok(());
        }

        let page_ids: Vec<RequestId> = page.iter().map(|r| r.id).collect();
        let prepared = match kind {
            RequestKind::Storage => location.prepare_for_storage(page).await,
            RequestKind::Deletion => location.prepare_for_deletion(page).await,
            RequestKind::Cache => location.prepare_for_restoration(page).await,
            RequestKind::Copy => Ok(PreparationResponse::default()),
        };
        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::error!(kind = %kind, backend, error = %e, "Batch preparation failed");
                let cause = e.to_string();
                for request_id in page_ids {
                    self.fail(kind, request_id, &cause, report).await;
                }
                return Ok(());
            }
        };

        let mut accounted: HashSet<RequestId> = HashSet::with_capacity(page_ids.len());
        for subset in prepared.working_subsets {
            accounted.extend(subset.iter().map(|r| r.id));
            match self.claim_subset(kind, backend, subset).await {
                Ok(Some((job_id, claimed))) => {
                    report.jobs += 1;
                    report.scheduled += claimed;
                    tracing::debug!(job_id = %job_id, kind = %kind, backend, claimed, "Working subset claimed");
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(kind = %kind, backend, error = %e, "Failed to create job");
                }
            }
        }
        for (request_id, cause) in prepared.preparation_errors {
            accounted.insert(request_id);
            self.fail(kind, request_id, &cause, report).await;
        }
        for request_id in page_ids {
            if !accounted.contains(&request_id) {
                tracing::warn!(kind = %kind, backend, request_id, "Request dropped by adapter");
                self.fail(kind, request_id, NOT_HANDLED_CAUSE, report).await;
            }
        }
        Ok(())
    }

    /// Claim the TO_DO requests of a subset for a new job, all or none.
    ///
    /// Rows that changed since the page was read are re-read; those no longer
    /// TO_DO are left out. Returns the job and the number of requests claimed.
    async fn claim_subset(
        &self,
        kind: RequestKind,
        backend: &str,
        mut subset: Vec<FileRequest>,
    ) -> EngineResult<Option<(Uuid, usize)>> {
        let metadata = self.engine.metadata();
        for _ in 0..self.engine.retries() {
            subset.retain(|r| r.status == RequestStatus::ToDo);
            if subset.is_empty() {
                return Ok(None);
            }
            let job_id = Uuid::new_v4();
            let patches: Vec<(RequestId, i64, RequestPatch)> = subset
                .iter()
                .map(|r| (r.id, r.version, RequestPatch::claimed(job_id)))
                .collect();
            let ids: Vec<RequestId> = subset.iter().map(|r| r.id).collect();
            match metadata.patch_requests(&patches).await {
                Ok(()) => {}
                Err(MetadataError::StaleWrite { .. } | MetadataError::NotFound(_)) => {
                    STALE_WRITE_RETRIES.inc();
                    subset = metadata.get_requests(&ids).await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            if let Err(e) = self
                .engine
                .jobs()
                .create_as_queued(job_id, kind, backend, &ids)
                .await
            {
                let cause = format!("Job could not be created: {e}");
                for request_id in &ids {
                    if let Err(e) = self
                        .engine
                        .handle_error(kind, *request_id, &cause, Some(job_id))
                        .await
                    {
                        tracing::error!(request_id, error = %e, "Failed to release request");
                    }
                }
                return Err(e);
            }
            return Ok(Some((job_id, ids.len())));
        }
        let first = subset.first().map(|r| r.id).unwrap_or_default();
        Err(EngineError::Contention(first))
    }

    async fn fail(&self, kind: RequestKind, request_id: RequestId, cause: &str, report: &mut SweepReport) {
        match self.engine.handle_error(kind, request_id, cause, None).await {
            Ok(()) => report.failed += 1,
            Err(e) => {
                tracing::error!(kind = %kind, request_id, error = %e, "Failed to record request error");
            }
        }
    }

    // =========================================================================
    // Undelay
    // =========================================================================

    /// Re-arbitrate DELAYED requests of every kind under the undelay lock.
    pub async fn run_undelay(&self) -> EngineResult<LockOutcome<usize>> {
        self.engine
            .lock()
            .execute_with_lock(UNDELAY_LOCK, self.engine.config().scheduler.lock_ttl(), || async {
                SWEEPS.with_label_values(&["undelay"]).inc();
                let mut released = 0;
                for kind in RequestKind::ALL {
                    match self.undelay(kind).await {
                        Ok(count) => released += count,
                        Err(e) => {
                            tracing::error!(kind = %kind, error = %e, "Undelay sweep failed");
                        }
                    }
                }
                if released > 0 {
                    tracing::info!(released, "Delayed requests released");
                }
                Ok(released)
            })
            .await
    }

    /// Re-arbitrate the oldest DELAYED requests of one kind.
    pub async fn undelay(&self, kind: RequestKind) -> EngineResult<usize> {
        match kind {
            RequestKind::Storage => self.engine.storage().check_delayed().await,
            RequestKind::Cache => self.engine.cache().check_delayed().await,
            RequestKind::Deletion | RequestKind::Copy => self.release_delayed(kind).await,
        }
    }

    async fn release_delayed(&self, kind: RequestKind) -> EngineResult<usize> {
        let delayed = self
            .engine
            .metadata()
            .list_requests_by_status(
                kind,
                RequestStatus::Delayed,
                self.engine.config().scheduler.undelay_batch_size,
            )
            .await?;
        let arbiter = self.engine.arbiter();
        let mut released = 0;
        for request in delayed {
            let status = arbiter
                .decide_status((&request).into(), RequestStatus::ToDo, ArbitrationMode::Undelay)
                .await?;
            if status == RequestStatus::Delayed {
                continue;
            }
            let promoted = self
                .engine
                .update_request(request.id, |current| {
                    (current.status == RequestStatus::Delayed).then(|| RequestPatch {
                        status: Some(status),
                        ..RequestPatch::default()
                    })
                })
                .await?;
            if promoted.is_some() {
                tracing::debug!(request_id = request.id, kind = %kind, "Delayed request released");
                released += 1;
            }
        }
        Ok(released)
    }

    // =========================================================================
    // Groups
    // =========================================================================

    /// Resolve complete groups under the groups lock.
    pub async fn run_groups_check(&self) -> EngineResult<LockOutcome<usize>> {
        self.engine
            .lock()
            .execute_with_lock(GROUPS_LOCK, self.engine.config().scheduler.lock_ttl(), || async {
                SWEEPS.with_label_values(&["groups"]).inc();
                self.engine.groups().check_groups_done().await
            })
            .await
    }

    /// Tear down expired groups under the expiry lock.
    pub async fn run_expiry(&self) -> EngineResult<LockOutcome<usize>> {
        self.engine
            .lock()
            .execute_with_lock(EXPIRY_LOCK, self.engine.config().scheduler.lock_ttl(), || async {
                SWEEPS.with_label_values(&["expiry"]).inc();
                self.engine.groups().expire_groups().await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_location_cause_text() {
        assert_eq!(
            unknown_location_cause("abc", "tape"),
            "File abc cannot be handled as storage location tape is unknown or disabled."
        );
    }
}
