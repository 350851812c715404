//! Conflict arbitration between request kinds on the same file.

use super::EngineResult;
use stowage_core::{
    FileRequest, NewFileRequest, RUNNING_OR_DELAYED_STATUSES, RUNNING_STATUSES, RequestId,
    RequestKind, RequestStatus,
};
use stowage_metadata::MetadataStore;
use stowage_metadata::repos::RequestRepo;

/// How peers of the same kind are counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbitrationMode {
    /// Creation and retry: DELAYED storage peers block new duplicates.
    Admission,
    /// Undelay sweep: DELAYED peers never block, so delayed duplicates cannot
    /// hold each other back forever.
    Undelay,
}

/// The request being arbitrated.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub kind: RequestKind,
    pub checksum: &'a str,
    pub backend: &'a str,
    /// Row id of the candidate itself, never counted as a conflict.
    pub id: Option<RequestId>,
}

impl<'a> From<&'a FileRequest> for Candidate<'a> {
    fn from(request: &'a FileRequest) -> Self {
        Self {
            kind: request.kind,
            checksum: &request.checksum,
            backend: &request.backend,
            id: Some(request.id),
        }
    }
}

impl<'a> From<&'a NewFileRequest> for Candidate<'a> {
    fn from(request: &'a NewFileRequest) -> Self {
        Self {
            kind: request.kind,
            checksum: &request.checksum,
            backend: &request.backend,
            id: None,
        }
    }
}

/// Decides whether a request may run now or has to wait for a conflicting one.
///
/// Every decision is an existence query against the store, so it always sees the
/// latest committed rows.
pub struct StatusArbiter<'a> {
    metadata: &'a dyn MetadataStore,
}

impl<'a> StatusArbiter<'a> {
    pub fn new(metadata: &'a dyn MetadataStore) -> Self {
        Self { metadata }
    }

    /// Status for `candidate`: `DELAYED` when a conflicting request is in flight,
    /// `default_status` otherwise. First matching rule wins.
    pub async fn decide_status(
        &self,
        candidate: Candidate<'_>,
        default_status: RequestStatus,
        mode: ArbitrationMode,
    ) -> EngineResult<RequestStatus> {
        let delayed = match candidate.kind {
            RequestKind::Storage => {
                self.running(
                    &[RequestKind::Deletion],
                    candidate.checksum,
                    Some(candidate.backend),
                    None,
                )
                .await?
                    || (default_status == RequestStatus::ToDo
                        && self.storage_peer_exists(candidate, mode).await?)
            }
            RequestKind::Deletion => {
                self.running(
                    &[RequestKind::Storage, RequestKind::Copy],
                    candidate.checksum,
                    None,
                    None,
                )
                .await?
            }
            RequestKind::Copy => {
                self.running(&[RequestKind::Deletion], candidate.checksum, None, None)
                    .await?
            }
            RequestKind::Cache => {
                self.running(
                    &[RequestKind::Cache],
                    candidate.checksum,
                    None,
                    candidate.id,
                )
                .await?
            }
        };

        let status = if delayed {
            RequestStatus::Delayed
        } else {
            default_status
        };
        tracing::debug!(
            kind = %candidate.kind,
            checksum = %candidate.checksum,
            backend = %candidate.backend,
            ?mode,
            status = %status,
            "Arbitrated request status"
        );
        Ok(status)
    }

    async fn running(
        &self,
        kinds: &[RequestKind],
        checksum: &str,
        backend: Option<&str>,
        exclude_id: Option<RequestId>,
    ) -> EngineResult<bool> {
        Ok(self
            .metadata
            .exists_request(kinds, checksum, backend, RUNNING_STATUSES, exclude_id)
            .await?)
    }

    async fn storage_peer_exists(
        &self,
        candidate: Candidate<'_>,
        mode: ArbitrationMode,
    ) -> EngineResult<bool> {
        let statuses = match mode {
            ArbitrationMode::Admission => RUNNING_OR_DELAYED_STATUSES,
            ArbitrationMode::Undelay => RUNNING_STATUSES,
        };
        Ok(self
            .metadata
            .exists_request(
                &[RequestKind::Storage],
                candidate.checksum,
                Some(candidate.backend),
                statuses,
                candidate.id,
            )
            .await?)
    }
}
