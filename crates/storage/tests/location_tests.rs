//! Filesystem locations driven through the registry.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use stowage_core::config::{LocationBackendConfig, LocationConfig};
use stowage_core::{FileRequest, RequestKind, RequestStatus, StorageType};
use stowage_storage::{FileOutcome, LocationRegistry};
use tempfile::TempDir;
use time::OffsetDateTime;

fn location_config(name: &str, path: PathBuf, storage_type: StorageType) -> LocationConfig {
    LocationConfig {
        name: name.to_string(),
        storage_type,
        enabled: true,
        internal_cache: true,
        files_per_job: 2,
        backend: LocationBackendConfig::Filesystem { path },
    }
}

fn request(id: i64, kind: RequestKind, checksum: &str, origin: Option<String>) -> FileRequest {
    let now = OffsetDateTime::now_utc();
    FileRequest {
        id,
        kind,
        checksum: checksum.to_string(),
        backend: String::new(),
        status: RequestStatus::Running,
        group_ids: BTreeSet::new(),
        owners: BTreeSet::new(),
        session_owner: String::new(),
        session: String::new(),
        job_id: None,
        error_cause: None,
        file_name: None,
        origin_url: origin,
        file_size: 0,
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

async fn registry(dir: &Path) -> LocationRegistry {
    LocationRegistry::from_config(&[
        location_config("disk", dir.join("disk"), StorageType::Online),
        location_config("tape", dir.join("tape"), StorageType::Nearline),
    ])
    .await
    .unwrap()
}

fn upload(dir: &TempDir, name: &str, data: &[u8]) -> String {
    let path = dir.path().join("incoming").join(name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, data).unwrap();
    format!("file://{}", path.display())
}

#[tokio::test]
async fn test_batch_store_reports_each_file() {
    let dir = TempDir::new().unwrap();
    let registry = registry(dir.path()).await;
    let disk = registry.get("disk").unwrap();

    let requests = vec![
        request(1, RequestKind::Storage, "f1", Some(upload(&dir, "f1", b"one"))),
        request(2, RequestKind::Storage, "f2", Some("file:///nonexistent/f2".to_string())),
        request(3, RequestKind::Storage, "f3", Some(upload(&dir, "f3", b"three"))),
    ];
    let results = disk.store(&requests).await;
    assert_eq!(results.len(), 3);

    let outcomes: Vec<(i64, bool)> = results
        .iter()
        .map(|r| (r.request_id, matches!(r.outcome, FileOutcome::Done { .. })))
        .collect();
    assert_eq!(outcomes, vec![(1, true), (2, false), (3, true)]);
    assert!(dir.path().join("disk").join("f3").exists());
}

#[tokio::test]
async fn test_store_is_idempotent_for_existing_file() {
    let dir = TempDir::new().unwrap();
    let registry = registry(dir.path()).await;
    let disk = registry.get("disk").unwrap();
    let origin = upload(&dir, "f4", b"four");

    let first = disk
        .store(&[request(1, RequestKind::Storage, "f4", Some(origin.clone()))])
        .await;
    std::fs::remove_file(origin.strip_prefix("file://").unwrap()).unwrap();

    // The origin is gone but the file already sits in the location.
    let second = disk
        .store(&[request(2, RequestKind::Storage, "f4", Some(origin))])
        .await;
    assert_eq!(first[0].outcome, second[0].outcome);
}

#[tokio::test]
async fn test_prepare_splits_by_files_per_job() {
    let dir = TempDir::new().unwrap();
    let registry = registry(dir.path()).await;
    let tape = registry.get("tape").unwrap();

    let requests = (1..=5)
        .map(|id| request(id, RequestKind::Deletion, &format!("d{id}"), None))
        .collect();
    let response = tape.prepare_for_deletion(requests).await.unwrap();
    let sizes: Vec<usize> = response.working_subsets.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![2, 2, 1]);
    assert!(response.preparation_errors.is_empty());
}

#[tokio::test]
async fn test_nearline_file_restores_into_cache_root() {
    let dir = TempDir::new().unwrap();
    let registry = registry(dir.path()).await;
    let tape = registry.get("tape").unwrap();
    assert_eq!(registry.storage_type("tape"), Some(StorageType::Nearline));

    let stored = tape
        .store(&[request(
            1,
            RequestKind::Storage,
            "r1",
            Some(upload(&dir, "r1", b"archived")),
        )])
        .await;
    let FileOutcome::Done { location_url, .. } = &stored[0].outcome else {
        panic!("store failed: {:?}", stored[0].outcome);
    };

    let cache_root = dir.path().join("cache");
    let restored = tape
        .restore(
            &[request(2, RequestKind::Cache, "r1", Some(location_url.clone()))],
            &cache_root,
        )
        .await;
    let FileOutcome::Done { location_url, file_size } = &restored[0].outcome else {
        panic!("restore failed: {:?}", restored[0].outcome);
    };
    assert_eq!(*file_size, 8);
    assert!(Path::new(location_url).starts_with(&cache_root));

    let missing = tape
        .restore(&[request(3, RequestKind::Cache, "r9", None)], &cache_root)
        .await;
    assert!(matches!(missing[0].outcome, FileOutcome::Failed(_)));
}
