//! Request group repository.

use crate::error::MetadataResult;
use crate::models::GroupRow;
use async_trait::async_trait;
use stowage_core::RequestResultInfo;

/// Repository for request groups and their recorded results.
#[async_trait]
pub trait GroupRepo: Send + Sync {
    /// Register a group. Returns false (and changes nothing) if the id is already alive.
    async fn create_group(&self, group: &GroupRow) -> MetadataResult<bool>;

    /// Get a live group.
    async fn get_group(&self, group_id: &str) -> MetadataResult<Option<GroupRow>>;

    /// Record one result. Returns false if the group is not alive or an identical
    /// (group, checksum, backend) result was already recorded.
    async fn record_group_result(&self, result: &RequestResultInfo) -> MetadataResult<bool>;

    /// Results recorded so far for a group.
    async fn list_group_results(&self, group_id: &str) -> MetadataResult<Vec<RequestResultInfo>>;

    /// Unexpired groups whose recorded result count reached their expected count,
    /// oldest first.
    async fn list_completed_groups(&self, now_unix: i64, limit: u32) -> MetadataResult<Vec<GroupRow>>;

    /// Atomically delete a completed group and return its results.
    ///
    /// Returns `None` when the group is gone, expired at `now_unix` or not complete.
    /// Only one caller can ever receive `Some` for a given group.
    async fn take_completed_group(
        &self,
        group_id: &str,
        now_unix: i64,
    ) -> MetadataResult<Option<(GroupRow, Vec<RequestResultInfo>)>>;

    /// Groups expired at `now_unix`, oldest first.
    async fn list_expired_groups(&self, now_unix: i64, limit: u32) -> MetadataResult<Vec<GroupRow>>;

    /// Delete a group and its results. Returns false if the group was already gone.
    async fn delete_group(&self, group_id: &str) -> MetadataResult<bool>;

    /// Number of live groups.
    async fn count_groups(&self) -> MetadataResult<i64>;
}
