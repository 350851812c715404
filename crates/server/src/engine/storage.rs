//! Storage requests: put a file on a storage location.

use super::arbiter::ArbitrationMode;
use super::session::SessionCounter;
use super::{Admission, BatchReceipt, Completion, Engine, EngineError, EngineResult, StageOutcome};
use serde::Deserialize;
use std::collections::BTreeMap;
use stowage_core::{CLAIMED_STATUSES, FileRequest, NewFileRequest, RequestKind, RequestStatus};
use stowage_metadata::models::FileReference;
use stowage_metadata::repos::{FileRefRepo, RequestRepo};
use stowage_metadata::RequestPatch;
use time::OffsetDateTime;
use uuid::Uuid;

/// Cause recorded on a waiting deletion cancelled by a new storage of its file.
pub const DELETION_CANCELLED_CAUSE: &str = "Deletion cancelled because file was stored again.";

/// A file to store.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageIntent {
    pub checksum: String,
    /// Destination storage location.
    pub backend: String,
    pub owner: String,
    /// Where the bytes are read from.
    pub origin_url: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: i64,
    #[serde(default)]
    pub storage_subdirectory: Option<String>,
    #[serde(default)]
    pub session_owner: String,
    #[serde(default)]
    pub session: String,
}

impl StorageIntent {
    fn into_request(self, group_id: &str) -> NewFileRequest {
        let mut request = NewFileRequest::new(RequestKind::Storage, self.checksum, self.backend)
            .with_group(group_id)
            .with_owner(self.owner)
            .with_session(self.session_owner, self.session)
            .with_origin(self.origin_url, self.file_size);
        request.file_name = self.file_name;
        request.storage_subdirectory = self.storage_subdirectory;
        request
    }
}

pub struct StorageRequests<'a> {
    engine: &'a Engine,
}

impl<'a> StorageRequests<'a> {
    pub(crate) fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }

    /// Accept a batch of files to store under `group_id`.
    pub async fn submit(
        &self,
        group_id: &str,
        intents: Vec<StorageIntent>,
        expiration: Option<OffsetDateTime>,
    ) -> EngineResult<BatchReceipt> {
        let kind = RequestKind::Storage;
        self.engine.check_batch(kind, group_id, intents.len())?;
        let requests: Vec<NewFileRequest> = intents
            .into_iter()
            .map(|intent| intent.into_request(group_id))
            .collect();
        for request in &requests {
            if let Err(e) = request.validate() {
                return Err(self.engine.deny(group_id, kind, e.into()));
            }
            if request.origin_url.as_deref().is_none_or(str::is_empty) {
                let reason = format!("missing origin for checksum {}", request.checksum);
                return Err(self.engine.deny(group_id, kind, EngineError::Invalid(reason)));
            }
        }

        let expected = super::expected_results(
            kind,
            requests
                .iter()
                .map(|r| (r.checksum.as_str(), r.backend.as_str())),
        );
        self.engine
            .groups()
            .granted(group_id, kind, expected, expiration, false)
            .await?;

        let mut receipt = BatchReceipt::new(group_id, expected);
        for request in requests {
            receipt.count(self.admit(request, group_id).await?);
        }
        tracing::info!(
            group_id,
            created = receipt.created,
            merged = receipt.merged,
            resolved = receipt.resolved,
            "Storage batch accepted"
        );
        Ok(receipt)
    }

    /// Store a file on behalf of another service, without registering a group.
    ///
    /// The request's groups still receive stage outcomes.
    pub async fn submit_internal(&self, request: NewFileRequest) -> EngineResult<()> {
        let Some(group_id) = request.group_ids.iter().next().cloned() else {
            return Err(EngineError::Internal(
                "internal storage request without group".to_string(),
            ));
        };
        self.admit(request, &group_id).await.map(|_| ())
    }

    async fn admit(&self, request: NewFileRequest, group_id: &str) -> EngineResult<Admission> {
        let metadata = self.engine.metadata();
        self.cancel_waiting_deletions(&request.checksum, &request.backend)
            .await?;

        let deletion_running = metadata
            .exists_request(
                &[RequestKind::Deletion],
                &request.checksum,
                Some(&request.backend),
                CLAIMED_STATUSES,
                None,
            )
            .await?;
        if !deletion_running
            && let Some(existing) = metadata
                .get_file_ref(&request.checksum, &request.backend)
                .await?
        {
            metadata
                .upsert_file_ref(&FileReference {
                    owners: request.owners.clone(),
                    ..existing.clone()
                })
                .await?;
            self.engine
                .resolve_immediately(
                    RequestKind::Storage,
                    group_id,
                    &request.checksum,
                    &request.backend,
                    &request.owners,
                    StageOutcome::Done(&existing.location_url),
                )
                .await?;
            return Ok(Admission::Resolved);
        }

        let failed = metadata
            .find_requests_by_checksums(RequestKind::Storage, std::slice::from_ref(&request.checksum))
            .await?
            .into_iter()
            .find(|r| r.backend == request.backend && r.status == RequestStatus::Error);
        self.engine.admit(request, failed.as_ref()).await
    }

    /// Drop deletions of this file that no job holds yet.
    async fn cancel_waiting_deletions(&self, checksum: &str, backend: &str) -> EngineResult<()> {
        let deletions = self
            .engine
            .metadata()
            .find_requests_by_checksums(RequestKind::Deletion, &[checksum.to_string()])
            .await?;
        for deletion in deletions {
            if deletion.backend != backend || deletion.status.is_claimed() {
                continue;
            }
            self.cancel_deletion(deletion).await?;
        }
        Ok(())
    }

    async fn cancel_deletion(&self, mut deletion: FileRequest) -> EngineResult<()> {
        let metadata = self.engine.metadata();
        for _ in 0..self.engine.retries() {
            if deletion.status.is_claimed() {
                return Ok(());
            }
            match metadata.delete_request(deletion.id, deletion.version).await {
                Ok(()) => {
                    tracing::info!(
                        request_id = deletion.id,
                        checksum = %deletion.checksum,
                        backend = %deletion.backend,
                        "Deletion cancelled by new storage"
                    );
                    if deletion.status == RequestStatus::Error {
                        self.engine
                            .count_session(&deletion, Some(SessionCounter::Error), None);
                    } else {
                        self.engine
                            .report_failure(&deletion, DELETION_CANCELLED_CAUSE)
                            .await?;
                    }
                    return Ok(());
                }
                Err(e) => self.engine.absorb_conflict(e, deletion.id)?,
            }
            match metadata.get_request(deletion.id).await? {
                Some(current) => deletion = current,
                None => return Ok(()),
            }
        }
        Err(EngineError::Contention(deletion.id))
    }

    /// Record a stored file and resolve its request.
    pub async fn handle_success(
        &self,
        request_id: i64,
        completion: &Completion,
        expected_job: Option<Uuid>,
    ) -> EngineResult<()> {
        let Some(request) = self.engine.active_request(request_id, expected_job).await? else {
            tracing::debug!(request_id, "Storage success for a request no longer active");
            return Ok(());
        };
        self.engine
            .metadata()
            .upsert_file_ref(&FileReference {
                checksum: request.checksum.clone(),
                backend: request.backend.clone(),
                file_name: request.file_name.clone(),
                file_size: completion.file_size,
                location_url: completion.location_url.clone(),
                owners: request.owners.clone(),
            })
            .await?;

        let Some(request) = self.engine.take_request(request_id, expected_job).await? else {
            return Ok(());
        };
        tracing::info!(
            request_id,
            checksum = %request.checksum,
            backend = %request.backend,
            location = %completion.location_url,
            "File stored"
        );
        self.engine
            .report_success(&request, Some(&completion.location_url))
            .await
    }

    /// Re-arbitrate DELAYED storage requests. Returns the number released.
    ///
    /// Delayed duplicates of one file are handled together: they succeed at once
    /// when the file already exists, otherwise they are merged into the oldest.
    pub async fn check_delayed(&self) -> EngineResult<usize> {
        let metadata = self.engine.metadata();
        let delayed = metadata
            .list_requests_by_status(
                RequestKind::Storage,
                RequestStatus::Delayed,
                self.engine.config().scheduler.undelay_batch_size,
            )
            .await?;

        let mut by_file: BTreeMap<(String, String), Vec<FileRequest>> = BTreeMap::new();
        for request in delayed {
            by_file
                .entry((request.backend.clone(), request.checksum.clone()))
                .or_default()
                .push(request);
        }

        let mut released = 0;
        for ((backend, checksum), rows) in by_file {
            match self.release(&backend, &checksum, rows).await {
                Ok(count) => released += count,
                Err(e) => {
                    tracing::error!(backend, checksum, error = %e, "Failed to release delayed storage requests");
                }
            }
        }
        Ok(released)
    }

    async fn release(
        &self,
        backend: &str,
        checksum: &str,
        mut rows: Vec<FileRequest>,
    ) -> EngineResult<usize> {
        rows.sort_by_key(|r| r.id);
        let Some(oldest) = rows.first() else {
            return Ok(0);
        };
        let status = self
            .engine
            .arbiter()
            .decide_status(oldest.into(), RequestStatus::ToDo, ArbitrationMode::Undelay)
            .await?;
        if status == RequestStatus::Delayed {
            return Ok(0);
        }

        let metadata = self.engine.metadata();
        if let Some(existing) = metadata.get_file_ref(checksum, backend).await? {
            let mut released = 0;
            for row in rows {
                let Some(request) = self.engine.take_request(row.id, None).await? else {
                    continue;
                };
                metadata
                    .upsert_file_ref(&FileReference {
                        owners: request.owners.clone(),
                        ..existing.clone()
                    })
                    .await?;
                self.engine
                    .report_success(&request, Some(&existing.location_url))
                    .await?;
                released += 1;
            }
            tracing::info!(backend, checksum, released, "Delayed storage requests resolved by existing file");
            return Ok(released);
        }

        let mut rows = rows.into_iter();
        let Some(oldest) = rows.next() else {
            return Ok(0);
        };
        let duplicates: Vec<FileRequest> = rows.collect();
        let merge = RequestPatch::merge(
            duplicates.iter().flat_map(|r| r.group_ids.iter().cloned()),
            duplicates.iter().flat_map(|r| r.owners.iter().cloned()),
        )
        .with_status(RequestStatus::ToDo);
        let promoted = self
            .engine
            .update_request(oldest.id, |current| {
                (current.status == RequestStatus::Delayed).then(|| merge.clone())
            })
            .await?;
        if promoted.is_none() {
            return Ok(0);
        }

        for duplicate in &duplicates {
            match metadata
                .delete_request(duplicate.id, duplicate.version)
                .await
            {
                Ok(()) => {
                    self.engine
                        .count_session(duplicate, Some(SessionCounter::Running), None);
                }
                Err(e) => {
                    tracing::debug!(
                        request_id = duplicate.id,
                        error = %e,
                        "Duplicate changed meanwhile, kept"
                    );
                }
            }
        }
        tracing::info!(
            request_id = oldest.id,
            backend,
            checksum,
            merged = duplicates.len(),
            "Delayed storage request released"
        );
        Ok(1)
    }
}
