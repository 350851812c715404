//! Group correlation and completion aggregation.
//!
//! A group is registered once per accepted batch with the number of distinct
//! (checksum, backend) results it waits for. Services record one result per
//! terminated request; the periodic check resolves groups whose stored result
//! count reached the expected count.

use super::events::EngineEvent;
use super::{Engine, EngineResult};
use crate::metrics::{GROUPS_EXPIRED, record_group_event};
use std::collections::BTreeSet;
use stowage_core::{GroupEventState, RequestKind, RequestResultInfo, RequestStatus};
use stowage_metadata::models::GroupRow;
use stowage_metadata::repos::{GroupRepo, RequestRepo};
use time::OffsetDateTime;

/// Cause recorded on requests of an expired group.
pub const GROUP_EXPIRED_CAUSE: &str = "group expired";

/// Backend under which a result is keyed.
///
/// Availability is per checksum whatever location serves it, so cache results
/// are keyed by checksum alone.
pub fn result_backend(kind: RequestKind, backend: &str) -> &str {
    match kind {
        RequestKind::Cache => "",
        _ => backend,
    }
}

pub struct GroupTracker<'a> {
    engine: &'a Engine,
}

impl<'a> GroupTracker<'a> {
    pub(crate) fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }

    /// Register a group waiting for `count` results.
    ///
    /// Returns false without side effects when the id is already alive. `silent`
    /// suppresses the GRANTED event.
    pub async fn granted(
        &self,
        group_id: &str,
        kind: RequestKind,
        count: usize,
        expiration: Option<OffsetDateTime>,
        silent: bool,
    ) -> EngineResult<bool> {
        let expiration = expiration.unwrap_or_else(|| {
            OffsetDateTime::now_utc() + self.engine.config().groups.default_expiration(kind)
        });
        let row = GroupRow::new(group_id, kind, count, expiration);
        if !self.engine.metadata().create_group(&row).await? {
            tracing::info!(group_id, kind = %kind, "Group already alive, skipping registration");
            return Ok(false);
        }

        tracing::info!(group_id, kind = %kind, count, "Group granted");
        if !silent {
            self.publish(group_id, kind, GroupEventState::Granted, None, Vec::new());
        }
        Ok(true)
    }

    /// Reject a batch. Nothing is persisted.
    pub fn denied(&self, group_id: &str, kind: RequestKind, reason: &str) {
        tracing::info!(group_id, kind = %kind, reason, "Group denied");
        self.publish(
            group_id,
            kind,
            GroupEventState::Denied,
            Some(reason.to_string()),
            Vec::new(),
        );
    }

    /// Record a successful result. Returns false if the group is not alive or
    /// already holds a result for this file.
    pub async fn request_success(
        &self,
        group_id: &str,
        kind: RequestKind,
        checksum: &str,
        backend: &str,
        owners: &BTreeSet<String>,
        result_file: Option<&str>,
    ) -> EngineResult<bool> {
        self.record(RequestResultInfo {
            group_id: group_id.to_string(),
            kind,
            checksum: checksum.to_string(),
            backend: result_backend(kind, backend).to_string(),
            owners: owners.clone(),
            is_error: false,
            error_cause: None,
            result_file: result_file.map(str::to_string),
        })
        .await
    }

    /// Record a failed result.
    pub async fn request_error(
        &self,
        group_id: &str,
        kind: RequestKind,
        checksum: &str,
        backend: &str,
        owners: &BTreeSet<String>,
        cause: &str,
    ) -> EngineResult<bool> {
        self.record(RequestResultInfo {
            group_id: group_id.to_string(),
            kind,
            checksum: checksum.to_string(),
            backend: result_backend(kind, backend).to_string(),
            owners: owners.clone(),
            is_error: true,
            error_cause: Some(cause.to_string()),
            result_file: None,
        })
        .await
    }

    async fn record(&self, info: RequestResultInfo) -> EngineResult<bool> {
        let recorded = self.engine.metadata().record_group_result(&info).await?;
        if !recorded {
            tracing::debug!(
                group_id = %info.group_id,
                checksum = %info.checksum,
                "Result not recorded: group not tracked or result already present"
            );
        }
        Ok(recorded)
    }

    /// Resolve complete groups, emitting one aggregate event per group.
    ///
    /// Completion is claimed in the store, so a group resolved concurrently by
    /// another process is skipped here.
    pub async fn check_groups_done(&self) -> EngineResult<usize> {
        let config = &self.engine.config().groups;
        let max_done = config.max_done_per_run as usize;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let candidates = self
            .engine
            .metadata()
            .list_completed_groups(now, config.page_size)
            .await?;

        let mut resolved = 0;
        for candidate in candidates {
            if resolved >= max_done {
                break;
            }
            let Some((group, results)) = self
                .engine
                .metadata()
                .take_completed_group(&candidate.group_id, now)
                .await?
            else {
                continue;
            };

            let kind = group.request_kind()?;
            let errors = results.iter().filter(|r| r.is_error).count();
            let state = if errors == 0 {
                GroupEventState::Success
            } else {
                GroupEventState::Error
            };
            tracing::info!(
                group_id = %group.group_id,
                kind = %kind,
                results = results.len(),
                errors,
                state = state.as_str(),
                "Group resolved"
            );
            self.publish(&group.group_id, kind, state, None, results);
            resolved += 1;
        }
        Ok(resolved)
    }

    /// Tear down expired groups. Their live requests fail with `group expired`.
    pub async fn expire_groups(&self) -> EngineResult<usize> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let expired = self
            .engine
            .metadata()
            .list_expired_groups(now, self.engine.config().groups.page_size)
            .await?;

        let mut torn_down = 0;
        for group in expired {
            match self.expire_group(&group).await {
                Ok(Some(failed)) => {
                    GROUPS_EXPIRED.inc();
                    torn_down += 1;
                    tracing::info!(group_id = %group.group_id, failed, "Group expired");
                }
                Ok(None) => {
                    tracing::debug!(group_id = %group.group_id, "Group already gone");
                }
                Err(e) => {
                    tracing::error!(
                        group_id = %group.group_id,
                        error = %e,
                        "Failed to expire group"
                    );
                }
            }
        }
        Ok(torn_down)
    }

    /// Drop the group, then fail its live requests. `None` if it was already gone.
    ///
    /// The group row goes first so no completion check can aggregate the
    /// failures recorded here.
    async fn expire_group(&self, group: &GroupRow) -> EngineResult<Option<usize>> {
        if !self.engine.metadata().delete_group(&group.group_id).await? {
            return Ok(None);
        }
        let mut failed = 0;
        for kind in RequestKind::ALL {
            failed += self.expire_requests(kind, &group.group_id).await?;
        }
        Ok(Some(failed))
    }

    /// Fail the live requests of one kind still referencing an expired group.
    async fn expire_requests(&self, kind: RequestKind, group_id: &str) -> EngineResult<usize> {
        let requests = self
            .engine
            .metadata()
            .list_requests_by_group(Some(kind), group_id)
            .await?;

        let mut failed = 0;
        for request in requests {
            if request.status == RequestStatus::Error {
                continue;
            }
            if self
                .engine
                .fail_request(request.id, GROUP_EXPIRED_CAUSE, None)
                .await?
                .is_some()
            {
                failed += 1;
            }
        }
        Ok(failed)
    }

    fn publish(
        &self,
        group_id: &str,
        kind: RequestKind,
        state: GroupEventState,
        reason: Option<String>,
        results: Vec<RequestResultInfo>,
    ) {
        record_group_event(kind.as_str(), state.as_str());
        self.engine.publisher().publish(EngineEvent::Group {
            group_id: group_id.to_string(),
            kind,
            state,
            reason,
            results,
        });
    }
}
