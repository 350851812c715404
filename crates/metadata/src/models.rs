//! Database models mapping to the request store schema.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::JobState;
use sqlx::FromRow;
use std::collections::BTreeSet;
use stowage_core::{FileRequest, RequestKind, RequestResultInfo, RequestStatus};
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// File requests
// =============================================================================

/// Flat file request row. Group ids and owners live in join tables.
#[derive(Debug, Clone, FromRow)]
pub struct FileRequestRow {
    pub request_id: i64,
    pub kind: String,
    pub checksum: String,
    pub backend: String,
    pub status: String,
    pub session_owner: String,
    pub session: String,
    pub job_id: Option<Uuid>,
    pub error_cause: Option<String>,
    pub file_name: Option<String>,
    pub origin_url: Option<String>,
    pub file_size: i64,
    pub storage_subdirectory: Option<String>,
    pub force_delete: bool,
    pub expiration_date: Option<OffsetDateTime>,
    pub cache_group_id: Option<String>,
    pub storage_group_id: Option<String>,
    pub version: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl FileRequestRow {
    /// Assemble the domain request from the row and its join-table sets.
    pub fn into_request(
        self,
        group_ids: BTreeSet<String>,
        owners: BTreeSet<String>,
    ) -> MetadataResult<FileRequest> {
        Ok(FileRequest {
            id: self.request_id,
            kind: self.kind.parse::<RequestKind>()?,
            checksum: self.checksum,
            backend: self.backend,
            status: self.status.parse::<RequestStatus>()?,
            group_ids,
            owners,
            session_owner: self.session_owner,
            session: self.session,
            job_id: self.job_id,
            error_cause: self.error_cause,
            file_name: self.file_name,
            origin_url: self.origin_url,
            file_size: self.file_size,
            storage_subdirectory: self.storage_subdirectory,
            force_delete: self.force_delete,
            expiration_date: self.expiration_date,
            cache_group_id: self.cache_group_id,
            storage_group_id: self.storage_group_id,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// =============================================================================
// Groups
// =============================================================================

/// A live request group.
#[derive(Debug, Clone, FromRow)]
pub struct GroupRow {
    pub group_id: String,
    pub kind: String,
    /// Number of distinct (checksum, backend) results the group waits for.
    pub expected_count: i64,
    /// Expiration as unix seconds.
    pub expires_at: i64,
    pub created_at: OffsetDateTime,
}

impl GroupRow {
    pub fn new(
        group_id: impl Into<String>,
        kind: RequestKind,
        expected_count: usize,
        expiration: OffsetDateTime,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            kind: kind.as_str().to_string(),
            expected_count: i64::try_from(expected_count).unwrap_or(i64::MAX),
            expires_at: expiration.unix_timestamp(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn request_kind(&self) -> MetadataResult<RequestKind> {
        Ok(self.kind.parse::<RequestKind>()?)
    }

    pub fn expiration_date(&self) -> MetadataResult<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp(self.expires_at)
            .map_err(|e| MetadataError::Corrupt(format!("group {} expiration: {e}", self.group_id)))
    }
}

/// One recorded result of a group member.
#[derive(Debug, Clone, FromRow)]
pub struct GroupResultRow {
    pub group_id: String,
    pub kind: String,
    pub checksum: String,
    pub backend: String,
    pub owners_json: String,
    pub is_error: bool,
    pub error_cause: Option<String>,
    pub result_file: Option<String>,
    pub created_at: OffsetDateTime,
}

impl GroupResultRow {
    pub fn from_info(info: &RequestResultInfo) -> MetadataResult<Self> {
        Ok(Self {
            group_id: info.group_id.clone(),
            kind: info.kind.as_str().to_string(),
            checksum: info.checksum.clone(),
            backend: info.backend.clone(),
            owners_json: serde_json::to_string(&info.owners)?,
            is_error: info.is_error,
            error_cause: info.error_cause.clone(),
            result_file: info.result_file.clone(),
            created_at: OffsetDateTime::now_utc(),
        })
    }

    pub fn into_info(self) -> MetadataResult<RequestResultInfo> {
        Ok(RequestResultInfo {
            group_id: self.group_id,
            kind: self.kind.parse::<RequestKind>()?,
            checksum: self.checksum,
            backend: self.backend,
            owners: serde_json::from_str(&self.owners_json)?,
            is_error: self.is_error,
            error_cause: self.error_cause,
            result_file: self.result_file,
        })
    }
}

// =============================================================================
// File reference catalog
// =============================================================================

/// Catalog row of a physically stored file.
#[derive(Debug, Clone, FromRow)]
pub struct FileRefRow {
    pub checksum: String,
    pub backend: String,
    pub file_name: Option<String>,
    pub file_size: i64,
    pub location_url: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// A stored file with its owners.
#[derive(Debug, Clone, PartialEq)]
pub struct FileReference {
    pub checksum: String,
    pub backend: String,
    pub file_name: Option<String>,
    pub file_size: i64,
    pub location_url: String,
    pub owners: BTreeSet<String>,
}

impl FileReference {
    pub fn from_row(row: FileRefRow, owners: BTreeSet<String>) -> Self {
        Self {
            checksum: row.checksum,
            backend: row.backend,
            file_name: row.file_name,
            file_size: row.file_size,
            location_url: row.location_url,
            owners,
        }
    }
}

// =============================================================================
// Cache entries
// =============================================================================

/// A file restored into the cache.
#[derive(Debug, Clone, FromRow)]
pub struct CacheFileRow {
    pub checksum: String,
    pub file_size: i64,
    pub location_url: String,
    pub expiration_date: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

/// A cache entry with the groups holding it.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheFile {
    pub checksum: String,
    pub file_size: i64,
    pub location_url: String,
    pub expiration_date: OffsetDateTime,
    pub group_ids: BTreeSet<String>,
}

// =============================================================================
// Jobs
// =============================================================================

/// Persisted asynchronous job.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub job_id: Uuid,
    pub kind: String,
    pub backend: String,
    /// JSON array of the request ids in the working subset.
    pub payload_json: String,
    pub state: String,
    pub error: Option<String>,
    pub created_at: OffsetDateTime,
    pub started_at: Option<OffsetDateTime>,
    pub finished_at: Option<OffsetDateTime>,
}

impl JobRow {
    pub fn request_kind(&self) -> MetadataResult<RequestKind> {
        Ok(self.kind.parse::<RequestKind>()?)
    }

    pub fn job_state(&self) -> MetadataResult<JobState> {
        self.state.parse::<JobState>()
    }

    /// Request ids of the working subset.
    pub fn request_ids(&self) -> MetadataResult<Vec<i64>> {
        Ok(serde_json::from_str(&self.payload_json)?)
    }
}

// =============================================================================
// Cluster locks
// =============================================================================

/// Named TTL-bound lock.
#[derive(Debug, Clone, FromRow)]
pub struct LockRow {
    pub lock_name: String,
    pub holder: String,
    /// Unix milliseconds after which the lock may be taken over.
    pub locked_until_ms: i64,
}
