//! Named storage location lookup.

use crate::backends::filesystem::FilesystemLocation;
use crate::error::StorageResult;
use crate::traits::StorageLocation;
use std::collections::HashMap;
use std::sync::Arc;
use stowage_core::StorageType;
use stowage_core::config::LocationConfig;

struct RegisteredLocation {
    location: Arc<dyn StorageLocation>,
    enabled: bool,
}

/// The set of configured storage locations.
#[derive(Default)]
pub struct LocationRegistry {
    locations: HashMap<String, RegisteredLocation>,
}

impl LocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from location configurations.
    pub async fn from_config(configs: &[LocationConfig]) -> StorageResult<Self> {
        let mut registry = Self::new();
        for config in configs {
            let location = FilesystemLocation::from_config(config).await?;
            tracing::info!(
                location = %config.name,
                storage_type = %config.storage_type,
                enabled = config.enabled,
                "Storage location registered"
            );
            registry.register(Arc::new(location), config.enabled);
        }
        Ok(registry)
    }

    /// Add or replace a location.
    pub fn register(&mut self, location: Arc<dyn StorageLocation>, enabled: bool) {
        self.locations.insert(
            location.name().to_string(),
            RegisteredLocation { location, enabled },
        );
    }

    /// Whether `name` is a known and enabled location.
    pub fn is_configured(&self, name: &str) -> bool {
        self.locations.get(name).is_some_and(|l| l.enabled)
    }

    /// Whether `name` is known, enabled or not.
    pub fn is_known(&self, name: &str) -> bool {
        self.locations.contains_key(name)
    }

    /// An enabled location by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn StorageLocation>> {
        self.locations
            .get(name)
            .filter(|l| l.enabled)
            .map(|l| Arc::clone(&l.location))
    }

    /// Access class of a known location.
    pub fn storage_type(&self, name: &str) -> Option<StorageType> {
        self.locations.get(name).map(|l| l.location.storage_type())
    }

    /// Names of all known locations, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.locations.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check every enabled location.
    pub async fn health_check(&self) -> StorageResult<()> {
        for registered in self.locations.values().filter(|l| l.enabled) {
            registered.location.health_check().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stowage_core::config::LocationBackendConfig;

    fn config(name: &str, path: std::path::PathBuf, enabled: bool) -> LocationConfig {
        LocationConfig {
            name: name.to_string(),
            storage_type: StorageType::Nearline,
            enabled,
            internal_cache: true,
            files_per_job: 10,
            backend: LocationBackendConfig::Filesystem { path },
        }
    }

    #[tokio::test]
    async fn test_disabled_location_is_known_but_not_configured() {
        let dir = tempfile::tempdir().unwrap();
        let registry = LocationRegistry::from_config(&[
            config("tape", dir.path().join("tape"), true),
            config("old", dir.path().join("old"), false),
        ])
        .await
        .unwrap();

        assert!(registry.is_configured("tape"));
        assert!(registry.get("tape").is_some());
        assert!(registry.is_known("old"));
        assert!(!registry.is_configured("old"));
        assert!(registry.get("old").is_none());
        assert!(!registry.is_configured("missing"));
        assert_eq!(registry.storage_type("tape"), Some(StorageType::Nearline));
        assert_eq!(registry.names(), vec!["old".to_string(), "tape".to_string()]);
        registry.health_check().await.unwrap();
    }
}
