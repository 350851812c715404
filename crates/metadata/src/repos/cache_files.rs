//! Cache entry repository.

use crate::error::MetadataResult;
use crate::models::CacheFile;
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for files restored into the cache.
#[async_trait]
pub trait CacheFileRepo: Send + Sync {
    /// Get a cache entry.
    async fn get_cache_file(&self, checksum: &str) -> MetadataResult<Option<CacheFile>>;

    /// Insert or refresh an entry and add its holding groups.
    /// The expiration only ever moves forward.
    async fn upsert_cache_file(&self, file: &CacheFile) -> MetadataResult<()>;

    /// Add holding groups to an existing entry and extend its expiration.
    /// Returns false if the entry does not exist.
    async fn hold_cache_file(
        &self,
        checksum: &str,
        group_ids: &[String],
        expiration: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Release one holding group. Returns the remaining holder count, or `None` if
    /// the entry does not exist.
    async fn release_cache_file(&self, checksum: &str, group_id: &str)
    -> MetadataResult<Option<usize>>;

    /// Delete an entry. Returns false if it did not exist.
    async fn delete_cache_file(&self, checksum: &str) -> MetadataResult<bool>;

    /// Total bytes used by cache entries.
    async fn total_cache_size(&self) -> MetadataResult<i64>;
}
