//! Request store abstraction and implementation for stowage.
//!
//! This crate provides the engine's only shared mutable ground truth:
//! - File requests of every kind, with optimistic row versions
//! - Request groups and their per-file results
//! - The file reference catalog and cache entries
//! - Persisted jobs
//! - Cluster-wide named locks

pub mod error;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use repos::RequestPatch;
pub use store::{MetadataStore, SqliteStore};

use std::sync::Arc;
use stowage_core::config::MetadataConfig;

/// Create a metadata store from configuration.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    match config {
        MetadataConfig::Sqlite {
            path,
            query_timeout_secs,
        } => {
            let store = SqliteStore::new(path, *query_timeout_secs).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
    }
}
