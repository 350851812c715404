//! Copy requests: duplicate a stored file onto another storage location.
//!
//! A copy has no job of its own. It drives two stage requests: an availability
//! request (PENDING, under `cache_group_id`) bringing the file to a readable
//! location, then a storage request to the destination (RUNNING, under
//! `storage_group_id`) reading from there. Stage outcomes come back through
//! [`CopyRequests::on_stage_result`].

use super::{Admission, BatchReceipt, Completion, Engine, EngineError, EngineResult, StageOutcome};
use serde::Deserialize;
use std::collections::BTreeSet;
use stowage_core::request::validate_checksum;
use stowage_core::{
    FileRequest, NewFileRequest, RUNNING_STATUSES, RequestId, RequestKind, RequestStatus,
};
use stowage_metadata::RequestPatch;
use stowage_metadata::repos::{FileRefRepo, RequestRepo};
use time::OffsetDateTime;
use uuid::Uuid;

pub fn missing_everywhere_cause(checksum: &str) -> String {
    format!("File {checksum} does not exist in any storage location.")
}

/// A file to copy onto `destination`.
#[derive(Debug, Clone, Deserialize)]
pub struct CopyIntent {
    pub checksum: String,
    pub destination: String,
    /// Owners of the new copy. Defaults to the owners of the source files.
    #[serde(default)]
    pub owners: BTreeSet<String>,
    #[serde(default)]
    pub storage_subdirectory: Option<String>,
    #[serde(default)]
    pub session_owner: String,
    #[serde(default)]
    pub session: String,
}

pub struct CopyRequests<'a> {
    engine: &'a Engine,
}

impl<'a> CopyRequests<'a> {
    pub(crate) fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }

    /// Accept a batch of copies under `group_id`.
    pub async fn submit(
        &self,
        group_id: &str,
        intents: Vec<CopyIntent>,
        expiration: Option<OffsetDateTime>,
    ) -> EngineResult<BatchReceipt> {
        let kind = RequestKind::Copy;
        self.engine.check_batch(kind, group_id, intents.len())?;
        for intent in &intents {
            if let Err(e) = validate_checksum(&intent.checksum) {
                return Err(self.engine.deny(group_id, kind, e.into()));
            }
            if intent.destination.trim().is_empty() {
                let reason = format!("missing destination for checksum {}", intent.checksum);
                return Err(self.engine.deny(group_id, kind, EngineError::Invalid(reason)));
            }
        }

        let expected = super::expected_results(
            kind,
            intents
                .iter()
                .map(|i| (i.checksum.as_str(), i.destination.as_str())),
        );
        self.engine
            .groups()
            .granted(group_id, kind, expected, expiration, false)
            .await?;

        let mut receipt = BatchReceipt::new(group_id, expected);
        for intent in intents {
            receipt.count(self.admit(group_id, intent).await?);
        }
        tracing::info!(
            group_id,
            created = receipt.created,
            merged = receipt.merged,
            resolved = receipt.resolved,
            "Copy batch accepted"
        );
        Ok(receipt)
    }

    async fn admit(&self, group_id: &str, intent: CopyIntent) -> EngineResult<Admission> {
        let metadata = self.engine.metadata();
        let references = metadata
            .find_file_refs(std::slice::from_ref(&intent.checksum))
            .await?;

        if let Some(present) = references.iter().find(|r| r.backend == intent.destination) {
            self.engine
                .resolve_immediately(
                    RequestKind::Copy,
                    group_id,
                    &intent.checksum,
                    &intent.destination,
                    &intent.owners,
                    StageOutcome::Done(&present.location_url),
                )
                .await?;
            return Ok(Admission::Resolved);
        }
        let Some(source) = references.first() else {
            let cause = missing_everywhere_cause(&intent.checksum);
            self.engine
                .resolve_immediately(
                    RequestKind::Copy,
                    group_id,
                    &intent.checksum,
                    &intent.destination,
                    &intent.owners,
                    StageOutcome::Failed(&cause),
                )
                .await?;
            return Ok(Admission::Resolved);
        };

        let owners = if intent.owners.is_empty() {
            references
                .iter()
                .flat_map(|r| r.owners.iter().cloned())
                .collect()
        } else {
            intent.owners
        };
        let existing = metadata
            .find_requests_by_checksums(RequestKind::Copy, std::slice::from_ref(&intent.checksum))
            .await?
            .into_iter()
            .filter(|r| r.backend == intent.destination)
            .min_by_key(|r| (r.status == RequestStatus::Error, r.id));

        let mut request = NewFileRequest::new(RequestKind::Copy, intent.checksum, intent.destination)
            .with_group(group_id)
            .with_owners(owners)
            .with_session(intent.session_owner, intent.session);
        request.file_name = source.file_name.clone();
        request.file_size = source.file_size;
        request.storage_subdirectory = intent.storage_subdirectory;
        self.engine.admit(request, existing.as_ref()).await
    }

    /// Whether a copy of one of `checksums` is waiting or in progress.
    pub async fn is_copy_running(&self, checksums: &[String]) -> EngineResult<bool> {
        let metadata = self.engine.metadata();
        for checksum in checksums {
            if metadata
                .exists_request(&[RequestKind::Copy], checksum, None, RUNNING_STATUSES, None)
                .await?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Start the availability stage of a TO_DO copy. Returns false if the copy
    /// left TO_DO meanwhile.
    pub async fn schedule(&self, copy: &FileRequest) -> EngineResult<bool> {
        let cache_group_id = Uuid::new_v4().to_string();
        let started = self
            .engine
            .update_request(copy.id, |current| {
                (current.status == RequestStatus::ToDo).then(|| RequestPatch {
                    status: Some(RequestStatus::Pending),
                    cache_group_id: Some(Some(cache_group_id.clone())),
                    storage_group_id: Some(None),
                    ..RequestPatch::default()
                })
            })
            .await?;
        if started.is_none() {
            return Ok(false);
        }
        tracing::info!(
            request_id = copy.id,
            checksum = %copy.checksum,
            destination = %copy.backend,
            cache_group_id,
            "Copy started"
        );
        self.engine
            .cache()
            .make_available(&cache_group_id, vec![copy.checksum.clone()], None, false)
            .await?;
        Ok(true)
    }

    /// React to the outcome of a stage request reported under `group_id`.
    pub async fn on_stage_result(
        &self,
        kind: RequestKind,
        group_id: &str,
        checksum: &str,
        outcome: StageOutcome<'_>,
    ) -> EngineResult<()> {
        let copies = self
            .engine
            .metadata()
            .find_copy_requests_by_stage_group(group_id)
            .await?;
        for copy in copies {
            if copy.checksum != checksum {
                continue;
            }
            match kind {
                RequestKind::Cache
                    if copy.cache_group_id.as_deref() == Some(group_id)
                        && copy.status == RequestStatus::Pending =>
                {
                    self.on_available(&copy, group_id, outcome).await?;
                }
                RequestKind::Storage
                    if copy.storage_group_id.as_deref() == Some(group_id)
                        && copy.status == RequestStatus::Running =>
                {
                    self.on_stored(&copy, outcome).await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn on_available(
        &self,
        copy: &FileRequest,
        cache_group_id: &str,
        outcome: StageOutcome<'_>,
    ) -> EngineResult<()> {
        let location = match outcome {
            StageOutcome::Done(location) => location,
            StageOutcome::Failed(cause) => {
                self.engine.fail_request(copy.id, cause, None).await?;
                return Ok(());
            }
        };

        let storage_group_id = Uuid::new_v4().to_string();
        let moved = self
            .engine
            .update_request(copy.id, |current| {
                (current.status == RequestStatus::Pending
                    && current.cache_group_id.as_deref() == Some(cache_group_id))
                .then(|| RequestPatch {
                    status: Some(RequestStatus::Running),
                    storage_group_id: Some(Some(storage_group_id.clone())),
                    ..RequestPatch::default()
                })
            })
            .await?;
        let Some(copy) = moved else {
            return Ok(());
        };
        tracing::info!(
            request_id = copy.id,
            checksum = %copy.checksum,
            source = location,
            storage_group_id,
            "Copy file available, storing to destination"
        );

        let mut storage = NewFileRequest::new(RequestKind::Storage, &copy.checksum, &copy.backend)
            .with_group(&storage_group_id)
            .with_owners(copy.owners.iter().cloned())
            .with_session(&copy.session_owner, &copy.session)
            .with_origin(location, copy.file_size);
        storage.file_name = copy.file_name.clone();
        storage.storage_subdirectory = copy.storage_subdirectory.clone();
        self.engine.storage().submit_internal(storage).await
    }

    async fn on_stored(&self, copy: &FileRequest, outcome: StageOutcome<'_>) -> EngineResult<()> {
        match outcome {
            StageOutcome::Done(location) => {
                let completion = Completion {
                    location_url: location.to_string(),
                    file_size: copy.file_size,
                };
                self.handle_success(copy.id, &completion).await
            }
            StageOutcome::Failed(cause) => {
                let failed = self.engine.fail_request(copy.id, cause, None).await?;
                if let Some(copy) = failed {
                    self.release_hold(&copy).await?;
                }
                Ok(())
            }
        }
    }

    /// The copy reached its destination.
    pub async fn handle_success(
        &self,
        request_id: RequestId,
        completion: &Completion,
    ) -> EngineResult<()> {
        let Some(copy) = self.engine.take_request(request_id, None).await? else {
            return Ok(());
        };
        tracing::info!(
            request_id,
            checksum = %copy.checksum,
            destination = %copy.backend,
            location = %completion.location_url,
            "File copied"
        );
        self.release_hold(&copy).await?;
        self.engine
            .report_success(&copy, Some(&completion.location_url))
            .await
    }

    async fn release_hold(&self, copy: &FileRequest) -> EngineResult<()> {
        match copy.cache_group_id.as_deref() {
            Some(cache_group_id) => {
                self.engine
                    .cache()
                    .release(&copy.checksum, cache_group_id)
                    .await
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_owners_default_to_empty() {
        let intent: CopyIntent = serde_json::from_value(serde_json::json!({
            "checksum": "abc",
            "destination": "tape"
        }))
        .unwrap();
        assert!(intent.owners.is_empty());
        assert_eq!(
            missing_everywhere_cause(&intent.checksum),
            "File abc does not exist in any storage location."
        );
    }
}
