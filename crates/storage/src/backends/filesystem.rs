//! Local filesystem storage location.

use crate::error::{StorageError, StorageResult};
use crate::traits::{FileOperationResult, PreparationResponse, StorageLocation};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use stowage_core::config::{LocationBackendConfig, LocationConfig};
use stowage_core::{FileRequest, StorageType};
use tokio::fs;
use tracing::instrument;
use uuid::Uuid;

/// Storage location backed by a local directory.
///
/// Files are stored at `<root>/<storage_subdirectory>/<checksum>` and their
/// location urls are absolute paths.
pub struct FilesystemLocation {
    name: String,
    root: PathBuf,
    storage_type: StorageType,
    internal_cache: bool,
    files_per_job: usize,
}

impl FilesystemLocation {
    /// Create the location, creating its root directory if needed.
    pub async fn new(
        name: impl Into<String>,
        root: impl AsRef<Path>,
        storage_type: StorageType,
        internal_cache: bool,
        files_per_job: usize,
    ) -> StorageResult<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root).await?;
        let root = fs::canonicalize(root).await?;
        Ok(Self {
            name: name.into(),
            root,
            storage_type,
            internal_cache,
            files_per_job: files_per_job.max(1),
        })
    }

    /// Create the location from its configuration.
    pub async fn from_config(config: &LocationConfig) -> StorageResult<Self> {
        config.validate().map_err(StorageError::Config)?;
        match &config.backend {
            LocationBackendConfig::Filesystem { path } => {
                Self::new(
                    config.name.clone(),
                    path,
                    config.storage_type,
                    config.internal_cache,
                    config.files_per_job,
                )
                .await
            }
        }
    }

    /// Canonical root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative key of a request's file inside the location.
    fn storage_key(request: &FileRequest) -> StorageResult<String> {
        stowage_core::request::validate_checksum(&request.checksum)
            .map_err(|e| StorageError::InvalidKey(e.to_string()))?;
        match request.storage_subdirectory.as_deref().map(|d| d.trim_matches('/')) {
            Some(dir) if !dir.is_empty() => Ok(format!("{dir}/{}", request.checksum)),
            _ => Ok(request.checksum.clone()),
        }
    }

    /// Relative key of a stored file from its location url.
    fn key_from_location(&self, location_url: &str) -> StorageResult<String> {
        let path = local_path(location_url);
        let rel = path.strip_prefix(&self.root).map_err(|_| {
            StorageError::InvalidPath(format!(
                "{location_url} is outside of location {}",
                self.name
            ))
        })?;
        Ok(rel.to_string_lossy().to_string())
    }

    /// Full path for a key, with path traversal protection.
    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || key_path_sync(&root, &key))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }

    async fn store_one(&self, request: &FileRequest) -> StorageResult<(String, i64)> {
        let origin = request.origin_url.as_deref().ok_or_else(|| {
            StorageError::InvalidPath(format!("file {} has no origin", request.checksum))
        })?;
        let key = Self::storage_key(request)?;
        let target = self.key_path(&key).await?;

        // A previous attempt may have completed before its job crashed.
        if let Ok(meta) = fs::metadata(&target).await
            && meta.is_file()
            && (request.file_size <= 0 || meta.len() == request.file_size as u64)
        {
            return Ok((target.display().to_string(), meta.len() as i64));
        }

        let size = copy_atomic(local_path(origin), &target).await?;
        let size = i64::try_from(size).unwrap_or(i64::MAX);
        if request.file_size > 0 && size != request.file_size {
            let _ = fs::remove_file(&target).await;
            return Err(StorageError::SizeMismatch {
                checksum: request.checksum.clone(),
                expected: request.file_size,
                actual: size,
            });
        }
        Ok((target.display().to_string(), size))
    }

    async fn delete_one(&self, request: &FileRequest) -> StorageResult<()> {
        let key = match request.origin_url.as_deref() {
            Some(url) => self.key_from_location(url)?,
            None => Self::storage_key(request)?,
        };
        let path = self.key_path(&key).await?;
        fs::remove_file(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(format!("{} on {}", request.checksum, self.name))
            } else {
                StorageError::Io(e)
            }
        })
    }

    async fn restore_one(
        &self,
        request: &FileRequest,
        cache_root: &Path,
    ) -> StorageResult<(String, i64)> {
        let key = match request.origin_url.as_deref() {
            Some(url) => self.key_from_location(url)?,
            None => Self::storage_key(request)?,
        };
        let source = self.key_path(&key).await?;
        if !fs::try_exists(&source).await? {
            return Err(StorageError::NotFound(format!(
                "{} on {}",
                request.checksum, self.name
            )));
        }

        fs::create_dir_all(cache_root).await?;
        let cache_root = cache_root.to_path_buf();
        let checksum = request.checksum.clone();
        let target = tokio::task::spawn_blocking(move || key_path_sync(&cache_root, &checksum))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })??;

        let size = copy_atomic(&source, &target).await?;
        Ok((
            target.display().to_string(),
            i64::try_from(size).unwrap_or(i64::MAX),
        ))
    }
}

/// Strip an optional `file://` scheme.
fn local_path(url: &str) -> &Path {
    Path::new(url.strip_prefix("file://").unwrap_or(url))
}

/// Copy `source` to `target` through a temporary file, fsync, then rename.
async fn copy_atomic(source: &Path, target: &Path) -> StorageResult<u64> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }

    let temp_name = format!(".tmp.{}", Uuid::new_v4());
    let temp_path = target.with_file_name(
        target
            .file_name()
            .map(|n| format!("{}{}", n.to_string_lossy(), temp_name))
            .unwrap_or_else(|| temp_name.clone()),
    );

    let size = match fs::copy(source, &temp_path).await {
        Ok(size) => size,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StorageError::NotFound(source.display().to_string()));
        }
        Err(e) => return Err(StorageError::Io(e)),
    };
    {
        let file = fs::OpenOptions::new().write(true).open(&temp_path).await?;
        file.sync_all().await?;
    }
    if let Err(e) = fs::rename(&temp_path, target).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StorageError::Io(e));
    }
    Ok(size)
}

/// Key path validation with path traversal protection.
///
/// Returns an error if the key would escape `root`, including through symlinks.
fn key_path_sync(root: &Path, key: &str) -> StorageResult<PathBuf> {
    if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
        return Err(StorageError::InvalidKey(format!(
            "path traversal not allowed: {key}"
        )));
    }
    for component in Path::new(key).components() {
        if !matches!(component, std::path::Component::Normal(_)) {
            return Err(StorageError::InvalidKey(format!(
                "contains unsafe path component: {key}"
            )));
        }
    }

    let path = root.join(key);
    let root_canonical = root.canonicalize()?;

    // Walk up from the target to the nearest existing entry and check it stays
    // inside the root once symlinks are resolved.
    let mut candidate = Some(path.as_path());
    while let Some(current) = candidate {
        match std::fs::symlink_metadata(current) {
            Ok(meta) => {
                let canonical = current.canonicalize().map_err(|e| {
                    if meta.file_type().is_symlink() {
                        StorageError::InvalidKey(format!("symlink target missing or invalid: {key}"))
                    } else {
                        StorageError::Io(e)
                    }
                })?;
                if !canonical.starts_with(&root_canonical) {
                    return Err(StorageError::InvalidKey(format!(
                        "resolved path escapes location root: {key}"
                    )));
                }
                return Ok(path);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                candidate = current.parent();
            }
            Err(err) => return Err(StorageError::Io(err)),
        }
    }

    Ok(path)
}

#[async_trait]
impl StorageLocation for FilesystemLocation {
    fn name(&self) -> &str {
        &self.name
    }

    fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    fn is_internal_cache(&self) -> bool {
        self.internal_cache
    }

    fn files_per_job(&self) -> usize {
        self.files_per_job
    }

    async fn prepare_for_storage(
        &self,
        requests: Vec<FileRequest>,
    ) -> StorageResult<PreparationResponse> {
        let mut response = PreparationResponse::default();
        let mut accepted = Vec::with_capacity(requests.len());
        for request in requests {
            if request.origin_url.is_none() {
                response.reject(
                    &request,
                    format!("Storage request for file {} has no origin.", request.checksum),
                );
            } else if let Err(e) = Self::storage_key(&request) {
                response.reject(&request, e.to_string());
            } else {
                accepted.push(request);
            }
        }
        response.push_chunked(accepted, self.files_per_job);
        Ok(response)
    }

    #[instrument(skip(self, requests), fields(location = %self.name, count = requests.len()))]
    async fn store(&self, requests: &[FileRequest]) -> Vec<FileOperationResult> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            match self.store_one(request).await {
                Ok((url, size)) => results.push(FileOperationResult::done(request.id, url, size)),
                Err(e) => {
                    tracing::warn!(checksum = %request.checksum, error = %e, "Store failed");
                    results.push(FileOperationResult::failed(request.id, e.to_string()));
                }
            }
        }
        results
    }

    #[instrument(skip(self, requests), fields(location = %self.name, count = requests.len()))]
    async fn delete(&self, requests: &[FileRequest]) -> Vec<FileOperationResult> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            match self.delete_one(request).await {
                Ok(()) => results.push(FileOperationResult::done(request.id, "", 0)),
                Err(e) => {
                    tracing::warn!(checksum = %request.checksum, error = %e, "Delete failed");
                    results.push(FileOperationResult::failed(request.id, e.to_string()));
                }
            }
        }
        results
    }

    #[instrument(skip(self, requests, cache_root), fields(location = %self.name, count = requests.len()))]
    async fn restore(&self, requests: &[FileRequest], cache_root: &Path) -> Vec<FileOperationResult> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            match self.restore_one(request, cache_root).await {
                Ok((url, size)) => results.push(FileOperationResult::done(request.id, url, size)),
                Err(e) => {
                    tracing::warn!(checksum = %request.checksum, error = %e, "Restore failed");
                    results.push(FileOperationResult::failed(request.id, e.to_string()));
                }
            }
        }
        results
    }

    async fn health_check(&self) -> StorageResult<()> {
        let meta = fs::metadata(&self.root).await?;
        if !meta.is_dir() {
            return Err(StorageError::InvalidPath(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::FileOutcome;
    use std::collections::BTreeSet;
    use stowage_core::{RequestKind, RequestStatus};
    use time::OffsetDateTime;

    fn request(id: i64, kind: RequestKind, checksum: &str) -> FileRequest {
        let now = OffsetDateTime::now_utc();
        FileRequest {
            id,
            kind,
            checksum: checksum.to_string(),
            backend: "disk".to_string(),
            status: RequestStatus::Running,
            group_ids: BTreeSet::new(),
            owners: BTreeSet::new(),
            session_owner: String::new(),
            session: String::new(),
            job_id: None,
            error_cause: None,
            file_name: None,
            origin_url: None,
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

    async fn location(dir: &Path) -> FilesystemLocation {
        FilesystemLocation::new("disk", dir.join("disk"), StorageType::Online, true, 10)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_store_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let location = location(dir.path()).await;
        let origin = dir.path().join("upload.bin");
        std::fs::write(&origin, b"hello").unwrap();

        let mut req = request(1, RequestKind::Storage, "abc123");
        req.origin_url = Some(format!("file://{}", origin.display()));
        req.storage_subdirectory = Some("projects/a".to_string());
        req.file_size = 5;

        let results = location.store(std::slice::from_ref(&req)).await;
        let FileOutcome::Done { location_url, file_size } = &results[0].outcome else {
            panic!("unexpected outcome: {:?}", results[0].outcome);
        };
        assert_eq!(*file_size, 5);
        assert!(location_url.ends_with("projects/a/abc123"));
        assert!(Path::new(location_url).exists());

        let mut del = request(2, RequestKind::Deletion, "abc123");
        del.origin_url = Some(location_url.clone());
        let results = location.delete(&[del.clone()]).await;
        assert!(matches!(results[0].outcome, FileOutcome::Done { .. }));
        assert!(!Path::new(location_url).exists());

        let results = location.delete(&[del]).await;
        assert!(matches!(results[0].outcome, FileOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_store_rejects_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let location = location(dir.path()).await;
        let origin = dir.path().join("upload.bin");
        std::fs::write(&origin, b"hello").unwrap();

        let mut req = request(1, RequestKind::Storage, "abc123");
        req.origin_url = Some(origin.display().to_string());
        req.file_size = 99;

        let results = location.store(&[req]).await;
        let FileOutcome::Failed(cause) = &results[0].outcome else {
            panic!("expected failure");
        };
        assert!(cause.contains("size mismatch"));
        assert!(!location.root().join("abc123").exists());
    }

    #[tokio::test]
    async fn test_prepare_for_storage_rejects_missing_origin() {
        let dir = tempfile::tempdir().unwrap();
        let location = location(dir.path()).await;

        let mut good = request(1, RequestKind::Storage, "aaa");
        good.origin_url = Some("/tmp/aaa".to_string());
        let missing = request(2, RequestKind::Storage, "bbb");
        let mut escaping = request(3, RequestKind::Storage, "ccc");
        escaping.origin_url = Some("/tmp/ccc".to_string());
        escaping.storage_subdirectory = Some("../outside".to_string());

        let response = location
            .prepare_for_storage(vec![good, missing, escaping])
            .await
            .unwrap();
        assert_eq!(response.working_subsets.len(), 1);
        assert_eq!(response.working_subsets[0][0].id, 1);
        assert!(response.preparation_errors[&2].contains("has no origin"));
        assert!(response.preparation_errors.contains_key(&3));
        assert_eq!(response.len(), 3);
    }

    #[tokio::test]
    async fn test_restore_into_cache() {
        let dir = tempfile::tempdir().unwrap();
        let location = location(dir.path()).await;
        std::fs::write(location.root().join("abc"), b"tape data").unwrap();
        let cache_root = dir.path().join("cache");

        let results = location
            .restore(&[request(7, RequestKind::Cache, "abc")], &cache_root)
            .await;
        let FileOutcome::Done { location_url, file_size } = &results[0].outcome else {
            panic!("unexpected outcome: {:?}", results[0].outcome);
        };
        assert_eq!(*file_size, 9);
        assert_eq!(std::fs::read(location_url).unwrap(), b"tape data");
    }

    #[tokio::test]
    async fn test_delete_rejects_foreign_location() {
        let dir = tempfile::tempdir().unwrap();
        let location = location(dir.path()).await;
        let foreign = dir.path().join("elsewhere");
        std::fs::write(&foreign, b"x").unwrap();

        let mut del = request(1, RequestKind::Deletion, "abc");
        del.origin_url = Some(foreign.display().to_string());
        let results = location.delete(&[del]).await;
        assert!(matches!(results[0].outcome, FileOutcome::Failed(_)));
        assert!(foreign.exists());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_symlink_traversal_rejected() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let location = location(dir.path()).await;
        symlink(outside.path(), location.root().join("escape")).unwrap();

        assert!(key_path_sync(location.root(), "escape/file").is_err());
        assert!(key_path_sync(location.root(), "valid/nested/key").is_ok());
        assert!(key_path_sync(location.root(), "../x").is_err());
    }
}
