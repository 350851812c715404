//! Scripted storage location adapter.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use stowage_core::{FileRequest, RequestId, StorageType};
use stowage_storage::{FileOperationResult, PreparationResponse, StorageLocation, StorageResult};

/// How the adapter answers for one checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(dead_code)]
pub enum Script {
    /// Reject the request during batch preparation.
    Reject(String),
    /// Leave the request out of the prepared batch.
    Omit,
    Fail(String),
    /// Leave the request out of the results.
    Drop,
    Panic,
}

/// A storage location whose outcomes are decided by the test.
///
/// Unscripted checksums succeed. Stored files live at `<name>://<checksum>`,
/// restored ones at `cache://<checksum>`.
#[allow(dead_code)]
pub struct ScriptedLocation {
    name: String,
    storage_type: StorageType,
    files_per_job: usize,
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<(&'static str, Vec<RequestId>)>>,
}

#[allow(dead_code)]
impl ScriptedLocation {
    pub fn new(name: &str, storage_type: StorageType) -> Self {
        Self {
            name: name.to_string(),
            storage_type,
            files_per_job: 100,
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn online(name: &str) -> Self {
        Self::new(name, StorageType::Online)
    }

    pub fn nearline(name: &str) -> Self {
        Self::new(name, StorageType::Nearline)
    }

    pub fn with_files_per_job(mut self, files_per_job: usize) -> Self {
        self.files_per_job = files_per_job;
        self
    }

    pub fn script(&self, checksum: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(checksum.to_string(), script);
    }

    pub fn clear(&self, checksum: &str) {
        self.scripts.lock().unwrap().remove(checksum);
    }

    /// Operations run so far, with the request ids of each call.
    pub fn calls(&self) -> Vec<(&'static str, Vec<RequestId>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn location_of(&self, checksum: &str) -> String {
        format!("{}://{checksum}", self.name)
    }

    fn prepare(&self, requests: Vec<FileRequest>) -> PreparationResponse {
        let scripts = self.scripts.lock().unwrap().clone();
        let mut response = PreparationResponse::default();
        let mut accepted = Vec::new();
        for request in requests {
            match scripts.get(&request.checksum) {
                Some(Script::Reject(cause)) => response.reject(&request, cause.clone()),
                Some(Script::Omit) => {}
                _ => accepted.push(request),
            }
        }
        response.push_chunked(accepted, self.files_per_job);
        response
    }

    fn run(
        &self,
        operation: &'static str,
        requests: &[FileRequest],
        location: impl Fn(&FileRequest) -> String,
    ) -> Vec<FileOperationResult> {
        self.calls
            .lock()
            .unwrap()
            .push((operation, requests.iter().map(|r| r.id).collect()));
        let scripts = self.scripts.lock().unwrap().clone();
        if requests
            .iter()
            .any(|r| scripts.get(&r.checksum) == Some(&Script::Panic))
        {
            panic!("scripted {operation} panic");
        }

        let dropped: HashSet<RequestId> = requests
            .iter()
            .filter(|r| scripts.get(&r.checksum) == Some(&Script::Drop))
            .map(|r| r.id)
            .collect();
        requests
            .iter()
            .filter(|r| !dropped.contains(&r.id))
            .map(|r| match scripts.get(&r.checksum) {
                Some(Script::Fail(cause)) => FileOperationResult::failed(r.id, cause.clone()),
                _ => FileOperationResult::done(r.id, location(r), r.file_size),
            })
            .collect()
    }
}

#[async_trait]
impl StorageLocation for ScriptedLocation {
    fn name(&self) -> &str {
        &self.name
    }

    fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    fn is_internal_cache(&self) -> bool {
        true
    }

    fn files_per_job(&self) -> usize {
        self.files_per_job
    }

    async fn prepare_for_storage(
        &self,
        requests: Vec<FileRequest>,
    ) -> StorageResult<PreparationResponse> {
        Ok(self.prepare(requests))
    }

    async fn prepare_for_deletion(
        &self,
        requests: Vec<FileRequest>,
    ) -> StorageResult<PreparationResponse> {
        Ok(self.prepare(requests))
    }

    async fn prepare_for_restoration(
        &self,
        requests: Vec<FileRequest>,
    ) -> StorageResult<PreparationResponse> {
        Ok(self.prepare(requests))
    }

    async fn store(&self, requests: &[FileRequest]) -> Vec<FileOperationResult> {
        self.run("store", requests, |r| self.location_of(&r.checksum))
    }

    async fn delete(&self, requests: &[FileRequest]) -> Vec<FileOperationResult> {
        self.run("delete", requests, |_| String::new())
    }

    async fn restore(&self, requests: &[FileRequest], _cache_root: &Path) -> Vec<FileOperationResult> {
        self.run("restore", requests, |r| format!("cache://{}", r.checksum))
    }
}
