//! Availability (cache) requests: make files readable, restoring them into the
//! cache when their best copy is nearline or offline.

use super::arbiter::ArbitrationMode;
use super::{Admission, BatchReceipt, Completion, Engine, EngineResult, StageOutcome};
use std::collections::BTreeSet;
use stowage_core::request::validate_checksum;
use stowage_core::{NewFileRequest, RequestId, RequestKind, RequestStatus, StorageType};
use stowage_metadata::RequestPatch;
use stowage_metadata::models::{CacheFile, FileReference};
use stowage_metadata::repos::{CacheFileRepo, FileRefRepo, RequestRepo};
use time::OffsetDateTime;
use uuid::Uuid;

pub fn missing_file_cause(checksum: &str) -> String {
    format!("File with checksum {checksum} does not exist.")
}

pub struct CacheRequests<'a> {
    engine: &'a Engine,
}

impl<'a> CacheRequests<'a> {
    pub(crate) fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }

    /// Accept a batch of files to make available under `group_id`.
    ///
    /// `expiration` is how long restored files must stay in the cache.
    pub async fn submit(
        &self,
        group_id: &str,
        checksums: Vec<String>,
        expiration: Option<OffsetDateTime>,
    ) -> EngineResult<BatchReceipt> {
        let kind = RequestKind::Cache;
        self.engine.check_batch(kind, group_id, checksums.len())?;
        for checksum in &checksums {
            if let Err(e) = validate_checksum(checksum) {
                return Err(self.engine.deny(group_id, kind, e.into()));
            }
        }
        self.make_available(group_id, checksums, expiration, true)
            .await
    }

    /// Make `checksums` available under `group_id`.
    ///
    /// With `track_group` false no group is registered, which is how the copy
    /// pipeline drives its availability stage.
    pub async fn make_available(
        &self,
        group_id: &str,
        checksums: Vec<String>,
        expiration: Option<OffsetDateTime>,
        track_group: bool,
    ) -> EngineResult<BatchReceipt> {
        let checksums: BTreeSet<String> = checksums.into_iter().collect();
        let expected = checksums.len();
        if track_group {
            self.engine
                .groups()
                .granted(group_id, RequestKind::Cache, expected, expiration, false)
                .await?;
        }

        let expiration = expiration.unwrap_or_else(|| {
            OffsetDateTime::now_utc() + self.engine.config().cache.default_availability()
        });
        let mut receipt = BatchReceipt::new(group_id, expected);
        for checksum in checksums {
            receipt.count(self.admit(group_id, &checksum, expiration).await?);
        }
        tracing::info!(
            group_id,
            created = receipt.created,
            merged = receipt.merged,
            resolved = receipt.resolved,
            "Availability batch accepted"
        );
        Ok(receipt)
    }

    async fn admit(
        &self,
        group_id: &str,
        checksum: &str,
        expiration: OffsetDateTime,
    ) -> EngineResult<Admission> {
        let metadata = self.engine.metadata();
        let owners = BTreeSet::new();

        if let Some(entry) = metadata.get_cache_file(checksum).await?
            && metadata
                .hold_cache_file(checksum, &[group_id.to_string()], expiration)
                .await?
        {
            self.engine
                .resolve_immediately(
                    RequestKind::Cache,
                    group_id,
                    checksum,
                    "",
                    &owners,
                    StageOutcome::Done(&entry.location_url),
                )
                .await?;
            return Ok(Admission::Resolved);
        }

        let references = metadata.find_file_refs(&[checksum.to_string()]).await?;
        let Some((storage_type, reference)) = self.best_reference(references) else {
            let cause = missing_file_cause(checksum);
            self.engine
                .resolve_immediately(
                    RequestKind::Cache,
                    group_id,
                    checksum,
                    "",
                    &owners,
                    StageOutcome::Failed(&cause),
                )
                .await?;
            return Ok(Admission::Resolved);
        };

        if !storage_type.needs_restoration() {
            self.engine
                .resolve_immediately(
                    RequestKind::Cache,
                    group_id,
                    checksum,
                    &reference.backend,
                    &owners,
                    StageOutcome::Done(&reference.location_url),
                )
                .await?;
            return Ok(Admission::Resolved);
        }

        let existing = metadata
            .find_requests_by_checksums(RequestKind::Cache, &[checksum.to_string()])
            .await?
            .into_iter()
            .min_by_key(|r| (r.status == RequestStatus::Error, r.id));
        let mut request = NewFileRequest::new(RequestKind::Cache, checksum, &reference.backend)
            .with_group(group_id)
            .with_origin(&reference.location_url, reference.file_size);
        request.file_name = reference.file_name.clone();
        request.expiration_date = Some(expiration);
        self.engine.admit(request, existing.as_ref()).await
    }

    /// The reference to read from: the most available known location first.
    fn best_reference(
        &self,
        references: Vec<FileReference>,
    ) -> Option<(StorageType, FileReference)> {
        let locations = self.engine.locations();
        references
            .into_iter()
            .filter_map(|reference| {
                let storage_type = locations.storage_type(&reference.backend)?;
                Some((storage_type, reference))
            })
            .min_by(|(a_type, a), (b_type, b)| {
                a_type.cmp(b_type).then_with(|| a.backend.cmp(&b.backend))
            })
    }

    /// A file was restored into the cache.
    pub async fn handle_success(
        &self,
        request_id: RequestId,
        completion: &Completion,
        expected_job: Option<Uuid>,
    ) -> EngineResult<()> {
        let Some(request) = self.engine.active_request(request_id, expected_job).await? else {
            tracing::debug!(request_id, "Restoration success for a request no longer active");
            return Ok(());
        };
        let expiration_date = request.expiration_date.unwrap_or_else(|| {
            OffsetDateTime::now_utc() + self.engine.config().cache.default_availability()
        });
        self.engine
            .metadata()
            .upsert_cache_file(&CacheFile {
                checksum: request.checksum.clone(),
                file_size: completion.file_size,
                location_url: completion.location_url.clone(),
                expiration_date,
                group_ids: request.group_ids.clone(),
            })
            .await?;

        let Some(request) = self.engine.take_request(request_id, expected_job).await? else {
            return Ok(());
        };
        tracing::info!(
            request_id,
            checksum = %request.checksum,
            location = %completion.location_url,
            "File available in cache"
        );
        self.engine
            .report_success(&request, Some(&completion.location_url))
            .await
    }

    /// Re-arbitrate DELAYED restorations. Returns the number released.
    ///
    /// A file that reached the cache meanwhile resolves its waiting requests
    /// without a new restoration.
    pub async fn check_delayed(&self) -> EngineResult<usize> {
        let metadata = self.engine.metadata();
        let delayed = metadata
            .list_requests_by_status(
                RequestKind::Cache,
                RequestStatus::Delayed,
                self.engine.config().scheduler.undelay_batch_size,
            )
            .await?;

        let mut released = 0;
        for request in delayed {
            if let Some(entry) = metadata.get_cache_file(&request.checksum).await? {
                let holders: Vec<String> = request.group_ids.iter().cloned().collect();
                let expiration = request.expiration_date.unwrap_or(entry.expiration_date);
                if metadata
                    .hold_cache_file(&request.checksum, &holders, expiration)
                    .await?
                    && let Some(taken) = self.engine.take_request(request.id, None).await?
                {
                    self.engine
                        .report_success(&taken, Some(&entry.location_url))
                        .await?;
                    released += 1;
                    continue;
                }
            }

            let status = self
                .engine
                .arbiter()
                .decide_status((&request).into(), RequestStatus::ToDo, ArbitrationMode::Undelay)
                .await?;
            if status == RequestStatus::Delayed {
                continue;
            }
            let promoted = self
                .engine
                .update_request(request.id, |current| {
                    (current.status == RequestStatus::Delayed).then(|| RequestPatch {
                        status: Some(RequestStatus::ToDo),
                        ..RequestPatch::default()
                    })
                })
                .await?;
            if promoted.is_some() {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Drop the hold of `group_id` on a cache entry.
    pub async fn release(&self, checksum: &str, group_id: &str) -> EngineResult<()> {
        let remaining = self
            .engine
            .metadata()
            .release_cache_file(checksum, group_id)
            .await?;
        tracing::debug!(checksum, group_id, ?remaining, "Cache hold released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_cause_names_checksum() {
        assert_eq!(
            missing_file_cause("abc"),
            "File with checksum abc does not exist."
        );
    }
}
