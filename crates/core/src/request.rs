//! File request kinds, the shared status state machine and request records.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Surrogate identity of a request row. Monotonic, so id order is creation order.
pub type RequestId = i64;

/// The four kinds of file requests handled by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    /// Store a file on a storage location.
    Storage,
    /// Remove an owner from a file and delete it once ownerless.
    Deletion,
    /// Copy a file from wherever it lives to another storage location.
    Copy,
    /// Make a file available (restore it into the cache if needed).
    Cache,
}

impl RequestKind {
    /// Every kind, in scheduling order.
    pub const ALL: [RequestKind; 4] = [Self::Storage, Self::Deletion, Self::Copy, Self::Cache];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Storage => "storage",
            Self::Deletion => "deletion",
            Self::Copy => "copy",
            Self::Cache => "cache",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "storage" => Ok(Self::Storage),
            "deletion" => Ok(Self::Deletion),
            "copy" => Ok(Self::Copy),
            "cache" => Ok(Self::Cache),
            other => Err(Error::InvalidKind(other.to_string())),
        }
    }
}

/// Request status. Terminal success is row deletion, not a status value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    /// Eligible for scheduling.
    ToDo,
    /// Claimed by a job.
    Pending,
    /// Job executing.
    Running,
    /// Blocked by a conflicting request. Never scheduled.
    Delayed,
    /// Terminal until retried.
    Error,
}

/// Statuses that count as in flight for arbitration.
pub const RUNNING_STATUSES: &[RequestStatus] = &[
    RequestStatus::ToDo,
    RequestStatus::Pending,
    RequestStatus::Running,
];

/// Statuses of a request held by a job.
pub const CLAIMED_STATUSES: &[RequestStatus] = &[RequestStatus::Pending, RequestStatus::Running];

/// Running statuses plus `DELAYED`.
pub const RUNNING_OR_DELAYED_STATUSES: &[RequestStatus] = &[
    RequestStatus::ToDo,
    RequestStatus::Pending,
    RequestStatus::Running,
    RequestStatus::Delayed,
];

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToDo => "TO_DO",
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Delayed => "DELAYED",
            Self::Error => "ERROR",
        }
    }

    /// In flight from the arbiter's point of view.
    pub fn is_running(&self) -> bool {
        RUNNING_STATUSES.contains(self)
    }

    /// Claimed by a job (PENDING or RUNNING).
    pub fn is_claimed(&self) -> bool {
        CLAIMED_STATUSES.contains(self)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "TO_DO" => Ok(Self::ToDo),
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "DELAYED" => Ok(Self::Delayed),
            "ERROR" => Ok(Self::Error),
            other => Err(Error::InvalidStatus(other.to_string())),
        }
    }
}

/// A persisted file request of any kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileRequest {
    pub id: RequestId,
    pub kind: RequestKind,
    pub checksum: String,
    /// Destination (storage, copy), origin (cache) or holder (deletion) location name.
    pub backend: String,
    pub status: RequestStatus,
    pub group_ids: BTreeSet<String>,
    pub owners: BTreeSet<String>,
    pub session_owner: String,
    pub session: String,
    pub job_id: Option<Uuid>,
    pub error_cause: Option<String>,
    pub file_name: Option<String>,
    pub origin_url: Option<String>,
    pub file_size: i64,
    pub storage_subdirectory: Option<String>,
    pub force_delete: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expiration_date: Option<OffsetDateTime>,
    pub cache_group_id: Option<String>,
    pub storage_group_id: Option<String>,
    /// Optimistic lock counter, bumped by every update.
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl FileRequest {
    /// The (backend, checksum) conflict key.
    pub fn conflict_key(&self) -> (&str, &str) {
        (&self.backend, &self.checksum)
    }

    /// Whether this request belongs to the given group.
    pub fn in_group(&self, group_id: &str) -> bool {
        self.group_ids.contains(group_id)
    }
}

/// A request to be inserted. Status is decided by the arbiter before insertion.
#[derive(Clone, Debug, PartialEq)]
pub struct NewFileRequest {
    pub kind: RequestKind,
    pub checksum: String,
    pub backend: String,
    pub status: RequestStatus,
    pub group_ids: BTreeSet<String>,
    pub owners: BTreeSet<String>,
    pub session_owner: String,
    pub session: String,
    pub error_cause: Option<String>,
    pub file_name: Option<String>,
    pub origin_url: Option<String>,
    pub file_size: i64,
    pub storage_subdirectory: Option<String>,
    pub force_delete: bool,
    pub expiration_date: Option<OffsetDateTime>,
    pub cache_group_id: Option<String>,
    pub storage_group_id: Option<String>,
}

impl NewFileRequest {
    /// Create a `TO_DO` intent with no groups, owners or session.
    pub fn new(kind: RequestKind, checksum: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            kind,
            checksum: checksum.into(),
            backend: backend.into(),
            status: RequestStatus::ToDo,
            group_ids: BTreeSet::new(),
            owners: BTreeSet::new(),
            session_owner: String::new(),
            session: String::new(),
            error_cause: None,
            file_name: None,
            origin_url: None,
            file_size: 0,
            storage_subdirectory: None,
            force_delete: false,
            expiration_date: None,
            cache_group_id: None,
            storage_group_id: None,
        }
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_ids.insert(group_id.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owners.insert(owner.into());
        self
    }

    pub fn with_owners<I, S>(mut self, owners: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.owners.extend(owners.into_iter().map(Into::into));
        self
    }

    pub fn with_session(mut self, session_owner: impl Into<String>, session: impl Into<String>) -> Self {
        self.session_owner = session_owner.into();
        self.session = session.into();
        self
    }

    pub fn with_status(mut self, status: RequestStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_origin(mut self, origin_url: impl Into<String>, file_size: i64) -> Self {
        self.origin_url = Some(origin_url.into());
        self.file_size = file_size;
        self
    }

    /// Check the checksum is non-empty, bounded and hex/alphanumeric.
    pub fn validate(&self) -> Result<()> {
        validate_checksum(&self.checksum)?;
        if self.backend.trim().is_empty() {
            return Err(Error::InvalidBatch(format!(
                "missing storage location for checksum {}",
                self.checksum
            )));
        }
        Ok(())
    }
}

/// Validate a checksum string.
pub fn validate_checksum(checksum: &str) -> Result<()> {
    if checksum.is_empty() {
        return Err(Error::InvalidChecksum("checksum is empty".to_string()));
    }
    if checksum.len() > crate::MAX_CHECKSUM_LEN {
        return Err(Error::InvalidChecksum(format!(
            "checksum longer than {} characters",
            crate::MAX_CHECKSUM_LEN
        )));
    }
    if !checksum.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(Error::InvalidChecksum(format!(
            "checksum contains invalid characters: {checksum}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_through_str() {
        for status in [
            RequestStatus::ToDo,
            RequestStatus::Pending,
            RequestStatus::Running,
            RequestStatus::Delayed,
            RequestStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<RequestStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<RequestStatus>().is_err());
    }

    #[test]
    fn running_set_excludes_delayed_and_error() {
        assert!(RequestStatus::ToDo.is_running());
        assert!(RequestStatus::Running.is_running());
        assert!(!RequestStatus::Delayed.is_running());
        assert!(!RequestStatus::Error.is_running());
        assert!(RUNNING_OR_DELAYED_STATUSES.contains(&RequestStatus::Delayed));
    }

    #[test]
    fn kind_parse_rejects_unknown() {
        assert_eq!("copy".parse::<RequestKind>().unwrap(), RequestKind::Copy);
        assert!(matches!(
            "move".parse::<RequestKind>(),
            Err(Error::InvalidKind(_))
        ));
    }

    #[test]
    fn status_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&RequestStatus::ToDo).unwrap();
        assert_eq!(json, "\"TO_DO\"");
    }

    #[test]
    fn new_request_validation() {
        let ok = NewFileRequest::new(RequestKind::Storage, "abc123", "disk");
        assert!(ok.validate().is_ok());

        let empty = NewFileRequest::new(RequestKind::Storage, "", "disk");
        assert!(empty.validate().is_err());

        let bad = NewFileRequest::new(RequestKind::Storage, "../etc", "disk");
        assert!(bad.validate().is_err());

        let no_backend = NewFileRequest::new(RequestKind::Storage, "abc", " ");
        assert!(no_backend.validate().is_err());
    }

    #[test]
    fn builder_merges_owners() {
        let req = NewFileRequest::new(RequestKind::Deletion, "abc", "disk")
            .with_owner("a")
            .with_owners(["b", "a"])
            .with_group("g1");
        assert_eq!(req.owners.len(), 2);
        assert!(req.group_ids.contains("g1"));
    }
}
