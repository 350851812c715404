//! File reference catalog repository.

use crate::error::MetadataResult;
use crate::models::FileReference;
use async_trait::async_trait;

/// Repository for the catalog of physically stored files.
#[async_trait]
pub trait FileRefRepo: Send + Sync {
    /// Get the reference of `checksum` on `backend`.
    async fn get_file_ref(&self, checksum: &str, backend: &str)
    -> MetadataResult<Option<FileReference>>;

    /// All references of the given checksums, on any backend.
    async fn find_file_refs(&self, checksums: &[String]) -> MetadataResult<Vec<FileReference>>;

    /// Create the reference if missing, then add `owners` to it.
    async fn upsert_file_ref(&self, reference: &FileReference) -> MetadataResult<FileReference>;

    /// Remove an owner. Returns the remaining owner count, or `None` when no reference exists.
    async fn remove_file_ref_owner(
        &self,
        checksum: &str,
        backend: &str,
        owner: &str,
    ) -> MetadataResult<Option<usize>>;

    /// Delete a reference and its owners. Returns false if it did not exist.
    async fn delete_file_ref(&self, checksum: &str, backend: &str) -> MetadataResult<bool>;
}
