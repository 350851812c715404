//! Job repository.

use crate::error::{MetadataError, MetadataResult};
use crate::models::JobRow;
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for persisted asynchronous jobs.
#[async_trait]
pub trait JobRepo: Send + Sync {
    /// Persist a job.
    async fn create_job(&self, job: &JobRow) -> MetadataResult<()>;

    /// Get a job by id.
    async fn get_job(&self, job_id: Uuid) -> MetadataResult<Option<JobRow>>;

    /// Move up to `limit` queued jobs to running and return them, oldest first.
    /// A job is only ever claimed once.
    async fn claim_queued_jobs(&self, limit: u32) -> MetadataResult<Vec<JobRow>>;

    /// Move a job to `state` if it is currently in one of `from`.
    /// Terminal states stamp `finished_at`. Returns false when no transition happened.
    async fn transition_job(
        &self,
        job_id: Uuid,
        from: &[JobState],
        state: JobState,
        error: Option<&str>,
    ) -> MetadataResult<bool>;

    /// Jobs currently in `state`.
    async fn list_jobs_by_state(&self, state: JobState) -> MetadataResult<Vec<JobRow>>;
}

/// Job states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Persisted, waiting for a dispatcher.
    Queued,
    /// Claimed by a process and executing.
    Running,
    /// Ran to completion.
    Succeeded,
    /// Returned an error.
    Failed,
    /// Terminated abnormally (panic or lost process).
    Crashed,
    /// Aborted by an operator.
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Crashed => "crashed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }
}

impl std::str::FromStr for JobState {
    type Err = MetadataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "crashed" => Ok(Self::Crashed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(MetadataError::Corrupt(format!("unknown job state: {other}"))),
        }
    }
}
