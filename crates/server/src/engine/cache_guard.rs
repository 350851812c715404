//! Cache capacity admission for restorations.

use super::EngineResult;
use super::events::{EngineEvent, EventPublisher};
use crate::metrics::CACHE_FULL_WARNINGS;
use std::sync::atomic::{AtomicBool, Ordering};
use stowage_core::{FileRequest, RequestKind, RequestStatus};
use stowage_metadata::MetadataStore;
use stowage_metadata::repos::{CacheFileRepo, RequestRepo};

/// Split `candidates` into those fitting in `available` bytes and the rest.
///
/// Candidates are walked in id order; each is admitted while the cumulative size
/// stays within `available`.
pub fn admit(
    mut candidates: Vec<FileRequest>,
    available: i64,
) -> (Vec<FileRequest>, Vec<FileRequest>) {
    candidates.sort_by_key(|r| r.id);
    let mut admitted = Vec::new();
    let mut deferred = Vec::new();
    let mut used: i64 = 0;
    for candidate in candidates {
        let size = candidate.file_size.max(0);
        match used.checked_add(size) {
            Some(total) if total <= available => {
                used = total;
                admitted.push(candidate);
            }
            _ => deferred.push(candidate),
        }
    }
    (admitted, deferred)
}

/// Holds back restorations that would overflow the cache.
///
/// Warns once when saturation is first seen and re-arms after a whole sweep
/// that deferred nothing.
pub struct CacheCapacityGuard {
    max_size_bytes: i64,
    warned: AtomicBool,
}

impl CacheCapacityGuard {
    pub fn new(max_size_bytes: u64) -> Self {
        Self {
            max_size_bytes: i64::try_from(max_size_bytes).unwrap_or(i64::MAX),
            warned: AtomicBool::new(false),
        }
    }

    /// Bytes still free for new restorations.
    pub async fn available_bytes(&self, metadata: &dyn MetadataStore) -> EngineResult<i64> {
        let (used, pending) = self.usage(metadata).await?;
        Ok(self
            .max_size_bytes
            .saturating_sub(used)
            .saturating_sub(pending)
            .max(0))
    }

    async fn usage(&self, metadata: &dyn MetadataStore) -> EngineResult<(i64, i64)> {
        let used = metadata.total_cache_size().await?;
        let pending = metadata
            .sum_request_sizes(
                RequestKind::Cache,
                &[RequestStatus::Pending, RequestStatus::Running],
            )
            .await?;
        Ok((used, pending))
    }

    /// The subset of `candidates` that may be restored now. The others stay TO_DO.
    pub async fn restorable(
        &self,
        metadata: &dyn MetadataStore,
        publisher: &dyn EventPublisher,
        candidates: Vec<FileRequest>,
    ) -> EngineResult<Vec<FileRequest>> {
        let (used, pending) = self.usage(metadata).await?;
        let available = self
            .max_size_bytes
            .saturating_sub(used)
            .saturating_sub(pending)
            .max(0);
        let (admitted, deferred) = admit(candidates, available);

        if deferred.is_empty() {
            return Ok(admitted);
        }
        if !self.warned.swap(true, Ordering::Relaxed) {
            let percent = if self.max_size_bytes > 0 {
                used.saturating_add(pending).saturating_mul(100) / self.max_size_bytes
            } else {
                100
            };
            let message = format!(
                "One or many files to restore are locked as the cache is full ({percent}%)"
            );
            tracing::warn!(deferred = deferred.len(), available, "{message}");
            CACHE_FULL_WARNINGS.inc();
            publisher.publish(EngineEvent::CacheFull { message });
        } else {
            tracing::debug!(deferred = deferred.len(), available, "Cache still full");
        }
        Ok(admitted)
    }

    /// Close a restoration sweep; re-arms the warning once nothing was deferred.
    pub fn finish_sweep(&self, deferred: usize) {
        if deferred == 0 && self.warned.swap(false, Ordering::Relaxed) {
            tracing::info!("Cache has room for every pending restoration again");
        }
    }

    /// Whether saturation was reported and not cleared since.
    pub fn has_warned(&self) -> bool {
        self.warned.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use time::OffsetDateTime;

    fn request(id: i64, file_size: i64) -> FileRequest {
        let now = OffsetDateTime::now_utc();
        FileRequest {
            id,
            kind: RequestKind::Cache,
            checksum: format!("c{id}"),
            backend: "tape".to_string(),
            status: RequestStatus::ToDo,
            group_ids: BTreeSet::new(),
            owners: BTreeSet::new(),
            session_owner: String::new(),
            session: String::new(),
            job_id: None,
            error_cause: None,
            file_name: None,
            origin_url: None,
            file_size,
            storage_subdirectory: None,
            force_delete: false,
            expiration_date: None,
            cache_group_id: None,
            storage_group_id: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn admit_walks_in_id_order() {
        let candidates = vec![request(3, 40), request(1, 50), request(2, 30)];
        let (admitted, deferred) = admit(candidates, 100);
        let admitted: Vec<_> = admitted.iter().map(|r| r.id).collect();
        let deferred: Vec<_> = deferred.iter().map(|r| r.id).collect();
        assert_eq!(admitted, vec![1, 2]);
        assert_eq!(deferred, vec![3]);
    }

    #[test]
    fn admitted_sizes_never_exceed_available() {
        let sizes = [7, 13, 1, 0, 25, 4, 9, 30, 2, 11];
        for available in [0, 1, 10, 20, 50, 101, 200] {
            let candidates = sizes
                .iter()
                .enumerate()
                .map(|(i, s)| request(i as i64, *s))
                .collect();
            let (admitted, deferred) = admit(candidates, available);
            let total: i64 = admitted.iter().map(|r| r.file_size).sum();
            assert!(total <= available, "{total} > {available}");
            assert_eq!(admitted.len() + deferred.len(), sizes.len());
        }
    }

    #[test]
    fn smaller_later_candidate_may_still_fit() {
        let (admitted, deferred) = admit(vec![request(1, 80), request(2, 30), request(3, 10)], 95);
        let admitted: Vec<_> = admitted.iter().map(|r| r.id).collect();
        assert_eq!(admitted, vec![1, 3]);
        assert_eq!(deferred.len(), 1);
    }
}
