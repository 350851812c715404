//! Configuration types shared across crates.

use crate::location::StorageType;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// HTTP server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    /// When enabled, restrict the endpoint to scraper networks at the infrastructure level.
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            metrics_enabled: true,
        }
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database.
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// Query timeout in seconds (advisory only, SQLite cannot cancel running queries).
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(600) // 10 minutes (advisory only)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

/// Scheduler configuration: sweep periods, page sizes and cluster lock TTL.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Prefix of the cluster lock holder (default: `stowage`). A random id per
    /// process is appended, so nodes may share it.
    #[serde(default)]
    pub node_id: Option<String>,
    /// Requests fetched per scheduler page (default: 100).
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Oldest DELAYED requests re-arbitrated per kind and undelay sweep (default: 500).
    #[serde(default = "default_undelay_batch_size")]
    pub undelay_batch_size: u32,
    /// Cluster lock TTL in seconds (default: 900). An overrunning sweep loses its lock.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// Storage request sweep period in seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub storage_interval_secs: u64,
    /// Deletion request sweep period in seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub deletion_interval_secs: u64,
    /// Cache request sweep period in seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub cache_interval_secs: u64,
    /// Copy request sweep period in seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub copy_interval_secs: u64,
    /// Undelay sweep period in seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub undelay_interval_secs: u64,
    /// Attempts made by bookkeeping writes that lose an optimistic lock race (default: 5).
    #[serde(default = "default_stale_write_retries")]
    pub stale_write_retries: u32,
}

fn default_page_size() -> u32 {
    100
}

fn default_undelay_batch_size() -> u32 {
    500
}

fn default_lock_ttl_secs() -> u64 {
    900 // 15 minutes
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_stale_write_retries() -> u32 {
    5
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            page_size: default_page_size(),
            undelay_batch_size: default_undelay_batch_size(),
            lock_ttl_secs: default_lock_ttl_secs(),
            storage_interval_secs: default_sweep_interval_secs(),
            deletion_interval_secs: default_sweep_interval_secs(),
            cache_interval_secs: default_sweep_interval_secs(),
            copy_interval_secs: default_sweep_interval_secs(),
            undelay_interval_secs: default_sweep_interval_secs(),
            stale_write_retries: default_stale_write_retries(),
        }
    }
}

impl SchedulerConfig {
    /// Validate scheduler configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.page_size == 0 {
            return Err("scheduler.page_size must be greater than 0".to_string());
        }
        if self.undelay_batch_size == 0 {
            return Err("scheduler.undelay_batch_size must be greater than 0".to_string());
        }
        if self.lock_ttl_secs == 0 {
            return Err("scheduler.lock_ttl_secs must be greater than 0".to_string());
        }
        if self.stale_write_retries == 0 {
            return Err("scheduler.stale_write_retries must be greater than 0".to_string());
        }
        for (name, secs) in [
            ("storage_interval_secs", self.storage_interval_secs),
            ("deletion_interval_secs", self.deletion_interval_secs),
            ("cache_interval_secs", self.cache_interval_secs),
            ("copy_interval_secs", self.copy_interval_secs),
            ("undelay_interval_secs", self.undelay_interval_secs),
        ] {
            if secs == 0 {
                return Err(format!("scheduler.{name} must be greater than 0"));
            }
        }
        Ok(())
    }

    /// Get the cluster lock TTL as a Duration.
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

/// Group tracking configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupsConfig {
    /// Groups inspected per page by the completion sweep (default: 500).
    #[serde(default = "default_groups_page_size")]
    pub page_size: u32,
    /// Groups resolved at most per completion sweep (default: 100).
    #[serde(default = "default_max_done_per_run")]
    pub max_done_per_run: u32,
    /// Completion sweep period in seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub check_interval_secs: u64,
    /// Expiry sweep period in seconds.
    #[serde(default = "default_expiry_interval_secs")]
    pub expiry_interval_secs: u64,
    /// Default lifetime of storage, deletion and copy groups (default: 5 days).
    #[serde(default = "default_request_group_expiration_hours")]
    pub request_expiration_hours: u64,
    /// Default lifetime of cache groups (default: 2 days).
    #[serde(default = "default_cache_group_expiration_hours")]
    pub cache_expiration_hours: u64,
}

fn default_groups_page_size() -> u32 {
    500
}

fn default_max_done_per_run() -> u32 {
    100
}

fn default_expiry_interval_secs() -> u64 {
    300
}

fn default_request_group_expiration_hours() -> u64 {
    5 * 24
}

fn default_cache_group_expiration_hours() -> u64 {
    2 * 24
}

impl Default for GroupsConfig {
    fn default() -> Self {
        Self {
            page_size: default_groups_page_size(),
            max_done_per_run: default_max_done_per_run(),
            check_interval_secs: default_sweep_interval_secs(),
            expiry_interval_secs: default_expiry_interval_secs(),
            request_expiration_hours: default_request_group_expiration_hours(),
            cache_expiration_hours: default_cache_group_expiration_hours(),
        }
    }
}

impl GroupsConfig {
    /// Validate group configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.page_size == 0 || self.max_done_per_run == 0 {
            return Err("groups.page_size and groups.max_done_per_run must be greater than 0".to_string());
        }
        if self.check_interval_secs == 0 || self.expiry_interval_secs == 0 {
            return Err("groups sweep intervals must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Default lifetime for a group of the given kind.
    pub fn default_expiration(&self, kind: crate::RequestKind) -> time::Duration {
        let hours = match kind {
            crate::RequestKind::Cache => self.cache_expiration_hours,
            _ => self.request_expiration_hours,
        };
        // Saturate at i64::MAX to prevent overflow wrapping to negative
        time::Duration::hours(i64::try_from(hours).unwrap_or(i64::MAX / 3600))
    }
}

/// Job runner configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Period in seconds between dispatches of queued jobs (default: 5).
    #[serde(default = "default_dispatch_interval_secs")]
    pub dispatch_interval_secs: u64,
    /// Period in seconds between crash checks of running job tasks (default: 10).
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,
    /// Queued jobs claimed per dispatch (default: 16).
    #[serde(default = "default_jobs_per_dispatch")]
    pub jobs_per_dispatch: u32,
}

fn default_dispatch_interval_secs() -> u64 {
    5
}

fn default_watchdog_interval_secs() -> u64 {
    10
}

fn default_jobs_per_dispatch() -> u32 {
    16
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            dispatch_interval_secs: default_dispatch_interval_secs(),
            watchdog_interval_secs: default_watchdog_interval_secs(),
            jobs_per_dispatch: default_jobs_per_dispatch(),
        }
    }
}

impl JobsConfig {
    /// Validate job runner configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.dispatch_interval_secs == 0 || self.watchdog_interval_secs == 0 {
            return Err("jobs intervals must be greater than 0".to_string());
        }
        if self.jobs_per_dispatch == 0 {
            return Err("jobs.jobs_per_dispatch must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Cache configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory receiving restored files.
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
    /// Capacity of the cache in bytes (default: 10 GiB).
    #[serde(default = "default_cache_max_size_bytes")]
    pub max_size_bytes: u64,
    /// Availability duration applied when a cache request carries none (default: 24h).
    #[serde(default = "default_cache_availability_hours")]
    pub default_availability_hours: u64,
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("./data/cache")
}

fn default_cache_max_size_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}

fn default_cache_availability_hours() -> u64 {
    24
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
            max_size_bytes: default_cache_max_size_bytes(),
            default_availability_hours: default_cache_availability_hours(),
        }
    }
}

impl CacheConfig {
    /// Validate cache configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_size_bytes == 0 {
            return Err("cache.max_size_bytes must be greater than 0".to_string());
        }
        if i64::try_from(self.max_size_bytes).is_err() {
            return Err("cache.max_size_bytes is too large".to_string());
        }
        Ok(())
    }

    /// Default availability as a time::Duration.
    pub fn default_availability(&self) -> time::Duration {
        time::Duration::hours(i64::try_from(self.default_availability_hours).unwrap_or(i64::MAX / 3600))
    }
}

/// Storage location backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LocationBackendConfig {
    /// Local filesystem directory.
    Filesystem {
        /// Root directory of the location.
        path: PathBuf,
    },
}

/// One configured storage location.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocationConfig {
    /// Unique location name, referenced by requests as their backend.
    pub name: String,
    /// Access class of the location (default: online).
    #[serde(default)]
    pub storage_type: StorageType,
    /// Disabled locations are known but refuse work (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Restorations from this location count against the internal cache (default: true).
    #[serde(default = "default_true")]
    pub internal_cache: bool,
    /// Maximum requests per working subset (default: 100).
    #[serde(default = "default_files_per_job")]
    pub files_per_job: usize,
    /// Backend implementation.
    #[serde(flatten)]
    pub backend: LocationBackendConfig,
}

fn default_files_per_job() -> usize {
    100
}

impl LocationConfig {
    /// Validate location configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("location name must not be empty".to_string());
        }
        if self.files_per_job == 0 {
            return Err(format!(
                "location '{}': files_per_job must be greater than 0",
                self.name
            ));
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub groups: GroupsConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub locations: Vec<LocationConfig>,
}

impl AppConfig {
    /// Validate the whole configuration.
    pub fn validate(&self) -> Result<(), String> {
        self.scheduler.validate()?;
        self.groups.validate()?;
        self.jobs.validate()?;
        self.cache.validate()?;

        let mut names = HashSet::new();
        for location in &self.locations {
            location.validate()?;
            if !names.insert(location.name.as_str()) {
                return Err(format!("duplicate location name '{}'", location.name));
            }
        }
        Ok(())
    }

    /// Create a minimal configuration for testing.
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig::default(),
            metadata: MetadataConfig::default(),
            scheduler: SchedulerConfig {
                node_id: Some("test-node".to_string()),
                ..SchedulerConfig::default()
            },
            groups: GroupsConfig::default(),
            jobs: JobsConfig::default(),
            cache: CacheConfig::default(),
            locations: Vec::new(),
        }
    }
}
