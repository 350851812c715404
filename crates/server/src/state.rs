//! Application state shared across handlers.

use crate::engine::Engine;
use std::sync::Arc;
use stowage_core::config::AppConfig;
use stowage_metadata::MetadataStore;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Orchestration engine.
    pub engine: Arc<Engine>,
    /// Request store.
    pub metadata: Arc<dyn MetadataStore>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            config: Arc::new(engine.config().clone()),
            metadata: engine.metadata().clone(),
            engine,
        }
    }
}
