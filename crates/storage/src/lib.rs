//! Storage location adapters for stowage.
//!
//! This crate provides:
//! - The `StorageLocation` adapter trait (batch preparation plus store, delete, restore)
//! - A registry of named, enabled or disabled locations
//! - A local filesystem location with atomic writes and traversal protection

pub mod backends;
pub mod error;
pub mod registry;
pub mod traits;

pub use backends::filesystem::FilesystemLocation;
pub use error::{StorageError, StorageResult};
pub use registry::LocationRegistry;
pub use traits::{FileOperationResult, FileOutcome, PreparationResponse, StorageLocation};
