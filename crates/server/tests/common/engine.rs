//! Engine test harness: a temporary SQLite store, scripted locations and
//! in-memory publishers.

use super::location::ScriptedLocation;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use stowage_core::config::AppConfig;
use stowage_core::{FileRequest, GroupEventState, RequestKind, RequestResultInfo, RequestStatus};
use stowage_metadata::repos::RequestRepo;
use stowage_metadata::{MetadataStore, SqliteStore};
use stowage_server::engine::events::{EngineEvent, RecordingPublisher};
use stowage_server::engine::jobs::{JobDispatcher, JobTaskRegistry, StoreJobRunner};
use stowage_server::engine::scheduler::SweepReport;
use stowage_server::engine::session::InMemorySessionNotifier;
use stowage_server::engine::copy::CopyIntent;
use stowage_server::engine::deletion::DeletionIntent;
use stowage_server::engine::storage::StorageIntent;
use stowage_server::Engine;
use stowage_storage::LocationRegistry;
use tempfile::TempDir;

/// An engine wired to test doubles.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestEngine {
    pub engine: Arc<Engine>,
    pub dispatcher: Arc<JobDispatcher>,
    pub metadata: Arc<dyn MetadataStore>,
    pub publisher: Arc<RecordingPublisher>,
    pub sessions: Arc<InMemorySessionNotifier>,
    pub locations: HashMap<String, Arc<ScriptedLocation>>,
    _temp_dir: TempDir,
}

/// Builder for [`TestEngine`].
#[allow(dead_code)]
pub struct TestEngineBuilder {
    config: AppConfig,
    locations: Vec<(Arc<ScriptedLocation>, bool)>,
}

#[allow(dead_code)]
impl TestEngineBuilder {
    pub fn location(mut self, location: ScriptedLocation) -> Self {
        self.locations.push((Arc::new(location), true));
        self
    }

    pub fn disabled_location(mut self, location: ScriptedLocation) -> Self {
        self.locations.push((Arc::new(location), false));
        self
    }

    pub fn config<F: FnOnce(&mut AppConfig)>(mut self, modifier: F) -> Self {
        modifier(&mut self.config);
        self
    }

    pub async fn build(self) -> TestEngine {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(temp_dir.path().join("metadata.db"), None)
                .await
                .expect("Failed to create metadata store"),
        );

        let mut config = self.config;
        config.cache.path = temp_dir.path().join("cache");

        let mut registry = LocationRegistry::new();
        let mut locations = HashMap::new();
        for (location, enabled) in self.locations {
            registry.register(location.clone(), enabled);
            locations.insert(location_name(&location), location);
        }

        let publisher = Arc::new(RecordingPublisher::new());
        let sessions = Arc::new(InMemorySessionNotifier::new());
        let tasks = Arc::new(JobTaskRegistry::new());
        let engine = Arc::new(Engine::new(
            Arc::new(config),
            metadata.clone(),
            Arc::new(registry),
            publisher.clone(),
            sessions.clone(),
            Arc::new(StoreJobRunner::new(metadata.clone(), tasks.clone())),
        ));
        let dispatcher = Arc::new(JobDispatcher::new(engine.clone(), tasks));

        TestEngine {
            engine,
            dispatcher,
            metadata,
            publisher,
            sessions,
            locations,
            _temp_dir: temp_dir,
        }
    }
}

fn location_name(location: &ScriptedLocation) -> String {
    use stowage_storage::StorageLocation;
    location.name().to_string()
}

#[allow(dead_code)]
impl TestEngine {
    pub fn builder() -> TestEngineBuilder {
        TestEngineBuilder {
            config: AppConfig::for_testing(),
            locations: Vec::new(),
        }
    }

    /// An engine with one online location named `disk`.
    pub async fn with_disk() -> Self {
        Self::builder()
            .location(ScriptedLocation::online("disk"))
            .build()
            .await
    }

    pub fn location(&self, name: &str) -> &Arc<ScriptedLocation> {
        self.locations
            .get(name)
            .unwrap_or_else(|| panic!("no location {name}"))
    }

    /// Schedule every TO_DO request of `kind`.
    pub async fn sweep(&self, kind: RequestKind) -> SweepReport {
        self.engine
            .scheduler()
            .sweep(kind)
            .await
            .expect("sweep failed")
    }

    /// Schedule `kind`, then run every queued job to completion.
    pub async fn run(&self, kind: RequestKind) -> SweepReport {
        let report = self.sweep(kind).await;
        self.dispatcher.drain().await.expect("drain failed");
        report
    }

    /// Store `checksum` on `backend` for `owner` and wait for the job.
    pub async fn seed(&self, checksum: &str, backend: &str, owner: &str) {
        let group_id = format!("seed-{checksum}-{backend}-{owner}");
        self.engine
            .storage()
            .submit(&group_id, vec![storage_intent(checksum, backend, owner)], None)
            .await
            .expect("seed submission failed");
        self.run(RequestKind::Storage).await;
    }

    /// Run the undelay sweep for every kind.
    pub async fn undelay(&self) -> usize {
        let mut released = 0;
        for kind in RequestKind::ALL {
            released += self
                .engine
                .scheduler()
                .undelay(kind)
                .await
                .expect("undelay failed");
        }
        released
    }

    pub async fn check_groups(&self) -> usize {
        self.engine
            .groups()
            .check_groups_done()
            .await
            .expect("groups check failed")
    }

    /// Every row of `kind`, whatever its status, ordered by id.
    pub async fn requests(&self, kind: RequestKind) -> Vec<FileRequest> {
        let mut rows = Vec::new();
        for status in [
            RequestStatus::ToDo,
            RequestStatus::Pending,
            RequestStatus::Running,
            RequestStatus::Delayed,
            RequestStatus::Error,
        ] {
            rows.extend(
                self.metadata
                    .list_requests_by_status(kind, status, 10_000)
                    .await
                    .unwrap(),
            );
        }
        rows.sort_by_key(|r| r.id);
        rows
    }

    pub async fn statuses(&self, kind: RequestKind) -> Vec<RequestStatus> {
        self.requests(kind).await.iter().map(|r| r.status).collect()
    }

    /// Aggregate and acknowledgment states published for one group.
    pub fn group_states(&self, group_id: &str) -> Vec<GroupEventState> {
        self.publisher
            .group_events(group_id)
            .iter()
            .filter_map(EngineEvent::group_state)
            .collect()
    }

    /// The aggregate event of a resolved group.
    pub fn aggregate(&self, group_id: &str) -> Option<EngineEvent> {
        self.publisher
            .group_events(group_id)
            .into_iter()
            .find(|e| {
                matches!(
                    e.group_state(),
                    Some(GroupEventState::Success | GroupEventState::Error)
                )
            })
    }

    /// Results carried by the aggregate event of a resolved group.
    pub fn aggregate_results(&self, group_id: &str) -> Vec<RequestResultInfo> {
        match self.aggregate(group_id) {
            Some(EngineEvent::Group { results, .. }) => results,
            _ => Vec::new(),
        }
    }
}

/// A storage intent reading from `file:///incoming/<checksum>`.
#[allow(dead_code)]
pub fn storage_intent(checksum: &str, backend: &str, owner: &str) -> StorageIntent {
    serde_json::from_value(serde_json::json!({
        "checksum": checksum,
        "backend": backend,
        "owner": owner,
        "origin_url": format!("file:///incoming/{checksum}"),
        "file_size": 100,
    }))
    .expect("valid storage intent")
}

#[allow(dead_code)]
pub fn deletion_intent(checksum: &str, owner: &str) -> DeletionIntent {
    serde_json::from_value(serde_json::json!({
        "checksum": checksum,
        "owner": owner,
    }))
    .expect("valid deletion intent")
}

/// A copy intent keeping the source owners.
#[allow(dead_code)]
pub fn copy_intent(checksum: &str, destination: &str) -> CopyIntent {
    serde_json::from_value(serde_json::json!({
        "checksum": checksum,
        "destination": destination,
    }))
    .expect("valid copy intent")
}

#[allow(dead_code)]
pub fn owners(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_string()).collect()
}
