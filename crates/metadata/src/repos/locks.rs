//! Cluster lock repository.

use crate::error::MetadataResult;
use crate::models::LockRow;
use async_trait::async_trait;
use std::time::Duration;

/// Repository backing named, TTL-bound cluster locks.
#[async_trait]
pub trait LockRepo: Send + Sync {
    /// Take `name` for `holder` until now + `ttl`.
    ///
    /// Succeeds when the lock is free, expired, or already held by `holder`.
    async fn try_acquire_lock(&self, name: &str, holder: &str, ttl: Duration)
    -> MetadataResult<bool>;

    /// Release `name` if held by `holder`. Returns false if it was not.
    async fn release_lock(&self, name: &str, holder: &str) -> MetadataResult<bool>;

    /// Current lock row, expired or not.
    async fn get_lock(&self, name: &str) -> MetadataResult<Option<LockRow>>;
}
