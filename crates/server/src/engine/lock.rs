//! Cluster-wide named locks guarding the periodic sweeps.

use super::EngineResult;
use crate::metrics::LOCK_SKIPS;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use stowage_core::RequestKind;
use stowage_metadata::MetadataStore;
use stowage_metadata::repos::LockRepo;

pub const STORAGE_LOCK: &str = "storage-requests-lock";
pub const DELETION_LOCK: &str = "deletion-requests-lock";
pub const CACHE_LOCK: &str = "cache-requests-lock";
pub const COPY_LOCK: &str = "copy-requests-lock";
pub const UNDELAY_LOCK: &str = "undelay-lock";
pub const GROUPS_LOCK: &str = "groups-lock";
pub const EXPIRY_LOCK: &str = "expiry-lock";

/// Lock guarding the scheduling sweep of one request kind.
pub fn sweep_lock_name(kind: RequestKind) -> &'static str {
    match kind {
        RequestKind::Storage => STORAGE_LOCK,
        RequestKind::Deletion => DELETION_LOCK,
        RequestKind::Cache => CACHE_LOCK,
        RequestKind::Copy => COPY_LOCK,
    }
}

/// Result of a locked execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome<T> {
    /// The lock was taken and the task ran.
    Executed(T),
    /// Another holder had the lock; the task did not run.
    Skipped,
}

impl<T> LockOutcome<T> {
    pub fn is_executed(&self) -> bool {
        matches!(self, Self::Executed(_))
    }

    pub fn into_inner(self) -> Option<T> {
        match self {
            Self::Executed(value) => Some(value),
            Self::Skipped => None,
        }
    }
}

/// TTL-bound locks stored in the request store, shared by every process.
///
/// A holder whose TTL elapsed is considered gone and its lock can be taken over.
pub struct ClusterLock {
    metadata: Arc<dyn MetadataStore>,
    holder: String,
}

impl ClusterLock {
    pub fn new(metadata: Arc<dyn MetadataStore>, holder: impl Into<String>) -> Self {
        Self {
            metadata,
            holder: holder.into(),
        }
    }

    /// Identity written into held locks.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Run `task` while holding `name`. Failing to take the lock is not an error.
    ///
    /// The lock is released once the task finished, whatever its result.
    pub async fn execute_with_lock<T, F, Fut>(
        &self,
        name: &str,
        ttl: Duration,
        task: F,
    ) -> EngineResult<LockOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        if !self
            .metadata
            .try_acquire_lock(name, &self.holder, ttl)
            .await?
        {
            LOCK_SKIPS.with_label_values(&[name]).inc();
            tracing::debug!(lock = name, holder = %self.holder, "Lock held elsewhere, skipping");
            return Ok(LockOutcome::Skipped);
        }

        let result = task().await;

        if let Err(e) = self.metadata.release_lock(name, &self.holder).await {
            tracing::warn!(lock = name, error = %e, "Failed to release lock, it will expire");
        }
        result.map(LockOutcome::Executed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stowage_metadata::SqliteStore;

    async fn store() -> (tempfile::TempDir, Arc<dyn MetadataStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("locks.db"), None)
            .await
            .unwrap();
        (dir, Arc::new(store))
    }

    #[tokio::test]
    async fn second_holder_skips_while_first_runs() {
        let (_dir, metadata) = store().await;
        let node_a = ClusterLock::new(metadata.clone(), "node-a");
        let node_b = ClusterLock::new(metadata.clone(), "node-b");
        let ttl = Duration::from_secs(60);

        let outcome = node_a
            .execute_with_lock(GROUPS_LOCK, ttl, || async {
                let inner = node_b
                    .execute_with_lock(GROUPS_LOCK, ttl, || async { Ok(2) })
                    .await?;
                Ok(inner)
            })
            .await
            .unwrap();
        assert_eq!(outcome, LockOutcome::Executed(LockOutcome::Skipped));

        // Released after the task, so the other node can take it now.
        let outcome = node_b
            .execute_with_lock(GROUPS_LOCK, ttl, || async { Ok(3) })
            .await
            .unwrap();
        assert_eq!(outcome.into_inner(), Some(3));
    }

    #[tokio::test]
    async fn expired_lock_is_taken_over() {
        let (_dir, metadata) = store().await;
        assert!(
            metadata
                .try_acquire_lock(EXPIRY_LOCK, "crashed-node", Duration::ZERO)
                .await
                .unwrap()
        );

        let node = ClusterLock::new(metadata.clone(), "node-b");
        let outcome = node
            .execute_with_lock(EXPIRY_LOCK, Duration::from_secs(60), || async { Ok(()) })
            .await
            .unwrap();
        assert!(outcome.is_executed());
    }

    #[tokio::test]
    async fn task_error_still_releases() {
        let (_dir, metadata) = store().await;
        let node = ClusterLock::new(metadata.clone(), "node-a");
        let ttl = Duration::from_secs(60);

        let result: EngineResult<LockOutcome<()>> = node
            .execute_with_lock(UNDELAY_LOCK, ttl, || async {
                Err(super::super::EngineError::Invalid("boom".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert!(metadata.get_lock(UNDELAY_LOCK).await.unwrap().is_none());
    }

    #[test]
    fn sweep_locks_are_distinct() {
        let names: std::collections::HashSet<_> =
            RequestKind::ALL.iter().map(|k| sweep_lock_name(*k)).collect();
        assert_eq!(names.len(), 4);
    }
}
