//! Caller and operator actions on existing requests.

use super::groups::result_backend;
use super::jobs::CANCELLED_CAUSE;
use super::session::SessionCounter;
use super::{Engine, EngineResult};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use stowage_core::{FileRequest, RequestId, RequestKind, RequestStatus};
use stowage_metadata::RequestPatch;
use stowage_metadata::repos::{GroupRepo, RequestRepo};
use uuid::Uuid;

/// Upper bound of PENDING requests stopped per call.
const STOP_SCAN_LIMIT: u32 = 10_000;

/// Request count for one (kind, status).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestStat {
    pub kind: String,
    pub status: String,
    pub count: i64,
}

impl Engine {
    /// Send one request in ERROR back through the arbiter.
    ///
    /// Requests in any other status are left alone and `false` is returned.
    pub async fn retry_request(&self, request_id: RequestId) -> EngineResult<bool> {
        let Some(request) = self.metadata().get_request(request_id).await? else {
            return Ok(false);
        };
        if request.status != RequestStatus::Error {
            return Ok(false);
        }
        self.rearbitrate(&request, RequestPatch::default()).await
    }

    /// Retry every failed request of a group. Returns the number retried.
    ///
    /// A group already resolved or expired is registered again, waiting for
    /// every request still referencing it.
    pub async fn retry_group(&self, group_id: &str) -> EngineResult<usize> {
        let requests = self.metadata().list_requests_by_group(None, group_id).await?;
        self.retry_failed(requests).await
    }

    /// Retry every failed request owned by one of `owners`. Returns the number retried.
    pub async fn retry_owners(&self, owners: &[String]) -> EngineResult<usize> {
        let mut failed = Vec::new();
        for kind in RequestKind::ALL {
            failed.extend(
                self.metadata()
                    .list_requests_by_owners(kind, owners, RequestStatus::Error)
                    .await?,
            );
        }
        self.retry_failed(failed).await
    }

    async fn retry_failed(&self, requests: Vec<FileRequest>) -> EngineResult<usize> {
        let failed: Vec<&FileRequest> = requests
            .iter()
            .filter(|r| r.status == RequestStatus::Error)
            .collect();
        let group_ids: BTreeSet<&str> = failed
            .iter()
            .flat_map(|r| r.group_ids.iter().map(String::as_str))
            .collect();
        for group_id in group_ids {
            self.regrant(group_id).await?;
        }

        let mut retried = 0;
        for request in failed {
            if self.rearbitrate(request, RequestPatch::default()).await? {
                retried += 1;
            }
        }
        Ok(retried)
    }

    /// Register a dead group again for the requests still referencing it.
    async fn regrant(&self, group_id: &str) -> EngineResult<()> {
        if self.metadata().get_group(group_id).await?.is_some() {
            return Ok(());
        }
        let members = self.metadata().list_requests_by_group(None, group_id).await?;
        let mut by_kind: BTreeMap<RequestKind, HashSet<(&str, &str)>> = BTreeMap::new();
        for member in &members {
            by_kind.entry(member.kind).or_default().insert((
                member.checksum.as_str(),
                result_backend(member.kind, &member.backend),
            ));
        }
        for (kind, keys) in by_kind {
            self.groups()
                .granted(group_id, kind, keys.len(), None, false)
                .await?;
        }
        Ok(())
    }

    /// Cancel the jobs of a group's claimed requests and fail those requests.
    pub async fn cancel_group(&self, group_id: &str) -> EngineResult<usize> {
        let requests = self.metadata().list_requests_by_group(None, group_id).await?;
        let claimed: Vec<FileRequest> = requests
            .into_iter()
            .filter(|r| r.status.is_claimed())
            .collect();
        let cancelled = self.cancel_claimed(claimed).await?;
        tracing::info!(group_id, cancelled, "Group cancelled");
        Ok(cancelled)
    }

    /// Cancel every PENDING request of `kind` and its job.
    pub async fn stop_pending(&self, kind: RequestKind) -> EngineResult<usize> {
        let pending = self
            .metadata()
            .list_requests_by_status(kind, RequestStatus::Pending, STOP_SCAN_LIMIT)
            .await?;
        let stopped = self.cancel_claimed(pending).await?;
        tracing::info!(kind = %kind, stopped, "Pending requests stopped");
        Ok(stopped)
    }

    /// Cancel the jobs of `requests` and fail those requests.
    ///
    /// Other requests claimed by a cancelled job go back to TO_DO.
    async fn cancel_claimed(&self, requests: Vec<FileRequest>) -> EngineResult<usize> {
        let jobs: BTreeSet<Uuid> = requests.iter().filter_map(|r| r.job_id).collect();
        let targeted: HashSet<RequestId> = requests.iter().map(|r| r.id).collect();
        let mut cancelled = Vec::new();
        for job_id in jobs {
            if self.jobs().cancel(job_id).await? {
                cancelled.push(job_id);
            } else {
                tracing::debug!(job_id = %job_id, "Job already finished");
            }
        }
        let mut failed = 0;
        for request in requests {
            if self
                .fail_request(request.id, CANCELLED_CAUSE, None)
                .await?
                .is_some()
            {
                failed += 1;
            }
        }
        for job_id in cancelled {
            let released = self.release_job(job_id, &targeted).await?;
            if released > 0 {
                tracing::info!(job_id = %job_id, released, "Requests of cancelled job rescheduled");
            }
        }
        Ok(failed)
    }

    /// Put the requests still claimed by `job_id` back to TO_DO, skipping `except`.
    async fn release_job(&self, job_id: Uuid, except: &HashSet<RequestId>) -> EngineResult<usize> {
        let mut released = 0;
        for request in self.metadata().list_requests_by_job(job_id).await? {
            if except.contains(&request.id) {
                continue;
            }
            let previous = self
                .update_request(request.id, |current| {
                    (current.job_id == Some(job_id) && current.status.is_claimed()).then(|| {
                        RequestPatch {
                            status: Some(RequestStatus::ToDo),
                            job_id: Some(None),
                            ..RequestPatch::default()
                        }
                    })
                })
                .await?;
            if previous.is_some() {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Purge the requests of `kind` on `backend`, optionally only those in `status`.
    pub async fn delete_by_backend(
        &self,
        kind: RequestKind,
        backend: &str,
        status: Option<RequestStatus>,
    ) -> EngineResult<usize> {
        let deleted = self
            .metadata()
            .delete_requests_by_backend(kind, backend, status)
            .await?;
        for request in &deleted {
            self.count_session(request, Some(SessionCounter::for_status(request.status)), None);
        }
        tracing::info!(kind = %kind, backend, status = ?status, deleted = deleted.len(), "Requests purged");
        Ok(deleted.len())
    }

    /// Request counts per kind and status.
    pub async fn stats(&self) -> EngineResult<Vec<RequestStat>> {
        Ok(self
            .metadata()
            .count_requests_by_status()
            .await?
            .into_iter()
            .map(|(kind, status, count)| RequestStat {
                kind,
                status,
                count,
            })
            .collect())
    }
}
