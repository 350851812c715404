//! Deletion requests: drop an owner from a file and remove the file once nobody owns it.

use super::{Admission, BatchReceipt, Engine, EngineError, EngineResult, StageOutcome};
use serde::Deserialize;
use std::collections::BTreeSet;
use stowage_core::request::validate_checksum;
use stowage_core::{FileRequest, NewFileRequest, RequestId, RequestKind, RequestStatus};
use stowage_metadata::models::FileReference;
use stowage_metadata::repos::{CacheFileRepo, FileRefRepo, RequestRepo};
use time::OffsetDateTime;
use uuid::Uuid;

/// Reason a batch is denied while a copy of one of its files runs.
pub const COPY_RUNNING_REASON: &str = "Cannot delete files as a copy process is running";

/// Cause recorded on availability requests whose source file was deleted.
pub const SOURCE_DELETED_CAUSE: &str = "File has been deleted from its storage location.";

/// An owner giving up a file.
#[derive(Debug, Clone, Deserialize)]
pub struct DeletionIntent {
    pub checksum: String,
    pub owner: String,
    /// Remove the reference even if the physical deletion fails.
    #[serde(default)]
    pub force_delete: bool,
    #[serde(default)]
    pub session_owner: String,
    #[serde(default)]
    pub session: String,
}

/// What one intent does to one file, decided before anything changes.
enum Step {
    /// The owner holds no reference to the file.
    Untracked(DeletionIntent),
    /// The owner holds this reference.
    Release(DeletionIntent, FileReference),
}

impl Step {
    fn key(&self) -> (&str, &str) {
        match self {
            Self::Untracked(intent) => (intent.checksum.as_str(), ""),
            Self::Release(_, reference) => (reference.checksum.as_str(), reference.backend.as_str()),
        }
    }
}

pub struct DeletionRequests<'a> {
    engine: &'a Engine,
}

impl<'a> DeletionRequests<'a> {
    pub(crate) fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }

    /// Accept a batch of deletions under `group_id`.
    ///
    /// The whole batch is denied when a copy runs on any of its files.
    pub async fn submit(
        &self,
        group_id: &str,
        intents: Vec<DeletionIntent>,
        expiration: Option<OffsetDateTime>,
    ) -> EngineResult<BatchReceipt> {
        let kind = RequestKind::Deletion;
        self.engine.check_batch(kind, group_id, intents.len())?;
        for intent in &intents {
            if let Err(e) = validate_checksum(&intent.checksum) {
                return Err(self.engine.deny(group_id, kind, e.into()));
            }
            if intent.owner.trim().is_empty() {
                let reason = format!("missing owner for checksum {}", intent.checksum);
                return Err(self.engine.deny(group_id, kind, EngineError::Invalid(reason)));
            }
        }

        let checksums: Vec<String> = intents
            .iter()
            .map(|i| i.checksum.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if self.engine.copy().is_copy_running(&checksums).await? {
            return Err(self.engine.deny(
                group_id,
                kind,
                EngineError::Denied(COPY_RUNNING_REASON.to_string()),
            ));
        }

        let references = self.engine.metadata().find_file_refs(&checksums).await?;
        let mut steps = Vec::new();
        for intent in intents {
            let held: Vec<&FileReference> = references
                .iter()
                .filter(|r| r.checksum == intent.checksum && r.owners.contains(&intent.owner))
                .collect();
            if held.is_empty() {
                steps.push(Step::Untracked(intent));
            } else {
                for reference in held {
                    steps.push(Step::Release(intent.clone(), reference.clone()));
                }
            }
        }

        let expected = super::expected_results(kind, steps.iter().map(Step::key));
        self.engine
            .groups()
            .granted(group_id, kind, expected, expiration, false)
            .await?;

        let mut receipt = BatchReceipt::new(group_id, expected);
        for step in steps {
            let admission = match step {
                Step::Untracked(intent) => {
                    self.resolve(group_id, &intent, "").await?;
                    Admission::Resolved
                }
                Step::Release(intent, reference) => {
                    self.release(group_id, intent, reference).await?
                }
            };
            receipt.count(admission);
        }
        tracing::info!(
            group_id,
            created = receipt.created,
            merged = receipt.merged,
            resolved = receipt.resolved,
            "Deletion batch accepted"
        );
        Ok(receipt)
    }

    async fn resolve(&self, group_id: &str, intent: &DeletionIntent, backend: &str) -> EngineResult<()> {
        let owners = BTreeSet::from([intent.owner.clone()]);
        self.engine
            .resolve_immediately(
                RequestKind::Deletion,
                group_id,
                &intent.checksum,
                backend,
                &owners,
                StageOutcome::Done(""),
            )
            .await
    }

    /// Remove the owner from one reference, deleting the file if it became ownerless.
    async fn release(
        &self,
        group_id: &str,
        intent: DeletionIntent,
        reference: FileReference,
    ) -> EngineResult<Admission> {
        let metadata = self.engine.metadata();
        let remaining = metadata
            .remove_file_ref_owner(&reference.checksum, &reference.backend, &intent.owner)
            .await?;
        if remaining != Some(0) {
            tracing::debug!(
                checksum = %reference.checksum,
                backend = %reference.backend,
                ?remaining,
                "File still owned, nothing to delete"
            );
            self.resolve(group_id, &intent, &reference.backend).await?;
            return Ok(Admission::Resolved);
        }

        if !self.engine.locations().is_configured(&reference.backend) {
            tracing::info!(
                checksum = %reference.checksum,
                backend = %reference.backend,
                "Location unavailable, dropping the reference without physical deletion"
            );
            self.forget_file(&reference.checksum, &reference.backend)
                .await?;
            self.resolve(group_id, &intent, &reference.backend).await?;
            return Ok(Admission::Resolved);
        }

        let existing = metadata
            .find_requests_by_checksums(RequestKind::Deletion, std::slice::from_ref(&reference.checksum))
            .await?
            .into_iter()
            .find(|r| r.backend == reference.backend);
        let mut request =
            NewFileRequest::new(RequestKind::Deletion, &reference.checksum, &reference.backend)
                .with_group(group_id)
                .with_owner(&intent.owner)
                .with_session(&intent.session_owner, &intent.session)
                .with_origin(&reference.location_url, reference.file_size);
        request.file_name = reference.file_name.clone();
        request.force_delete = intent.force_delete;
        self.engine.admit(request, existing.as_ref()).await
    }

    /// The file is gone: drop its reference, the restorations reading it and
    /// its cache entry once unheld.
    async fn forget_file(&self, checksum: &str, backend: &str) -> EngineResult<()> {
        let metadata = self.engine.metadata();
        metadata.delete_file_ref(checksum, backend).await?;

        let restorations = metadata
            .find_requests_by_checksums(RequestKind::Cache, &[checksum.to_string()])
            .await?;
        for restoration in restorations {
            if restoration.backend != backend {
                continue;
            }
            self.drop_restoration(restoration).await?;
        }

        if let Some(entry) = metadata.get_cache_file(checksum).await?
            && entry.group_ids.is_empty()
        {
            metadata.delete_cache_file(checksum).await?;
            tracing::debug!(checksum, "Unheld cache entry removed");
        }
        Ok(())
    }

    async fn drop_restoration(&self, restoration: FileRequest) -> EngineResult<()> {
        if restoration.status.is_claimed() {
            // A job is reading the file right now and reports its own outcome.
            return Ok(());
        }
        let failed = match restoration.status {
            RequestStatus::Error => Some(restoration.clone()),
            _ => {
                self.engine
                    .fail_request(restoration.id, SOURCE_DELETED_CAUSE, None)
                    .await?
            }
        };
        if failed.is_some() {
            let current = self.engine.metadata().get_request(restoration.id).await?;
            if let Some(current) = current
                && let Err(e) = self
                    .engine
                    .metadata()
                    .delete_request(current.id, current.version)
                    .await
            {
                tracing::debug!(request_id = current.id, error = %e, "Restoration changed meanwhile, kept");
            }
        }
        Ok(())
    }

    /// The file was physically deleted.
    pub async fn handle_success(
        &self,
        request_id: RequestId,
        expected_job: Option<Uuid>,
    ) -> EngineResult<()> {
        let Some(request) = self.engine.take_request(request_id, expected_job).await? else {
            tracing::debug!(request_id, "Deletion success for a request no longer active");
            return Ok(());
        };
        self.forget_file(&request.checksum, &request.backend)
            .await?;
        tracing::info!(
            request_id,
            checksum = %request.checksum,
            backend = %request.backend,
            "File deleted"
        );
        self.engine.report_success(&request, None).await
    }

    /// The physical deletion failed. Forced deletions still drop the reference.
    pub async fn handle_error(
        &self,
        request_id: RequestId,
        cause: &str,
        expected_job: Option<Uuid>,
    ) -> EngineResult<()> {
        let Some(request) = self.engine.active_request(request_id, expected_job).await? else {
            return Ok(());
        };
        if request.force_delete {
            tracing::warn!(
                request_id,
                checksum = %request.checksum,
                backend = %request.backend,
                cause,
                "Forced deletion failed physically, removing the reference anyway"
            );
            return self.handle_success(request_id, expected_job).await;
        }
        self.engine
            .fail_request(request_id, cause, expected_job)
            .await
            .map(|_| ())
    }
}
