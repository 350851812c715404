//! Storage location types.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Access class of a storage location.
///
/// Ordering is availability priority: online files are served directly,
/// nearline and offline files must be restored into the cache first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Online,
    Nearline,
    Offline,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Nearline => "nearline",
            Self::Offline => "offline",
        }
    }

    /// Whether reading a file requires a restoration into the cache.
    pub fn needs_restoration(&self) -> bool {
        !matches!(self, Self::Online)
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "online" => Ok(Self::Online),
            "nearline" => Ok(Self::Nearline),
            "offline" => Ok(Self::Offline),
            other => Err(Error::InvalidStorageType(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order() {
        let mut types = vec![StorageType::Offline, StorageType::Online, StorageType::Nearline];
        types.sort();
        assert_eq!(
            types,
            vec![StorageType::Online, StorageType::Nearline, StorageType::Offline]
        );
    }

    #[test]
    fn only_online_skips_restoration() {
        assert!(!StorageType::Online.needs_restoration());
        assert!(StorageType::Nearline.needs_restoration());
        assert!(StorageType::Offline.needs_restoration());
    }
}
