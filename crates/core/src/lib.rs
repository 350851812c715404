//! Core domain types and shared logic for the stowage file request engine.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Request kinds and the status state machine
//! - File requests and their creation intents
//! - Group outcomes and per-file result infos
//! - Storage location types
//! - Application configuration

pub mod config;
pub mod error;
pub mod group;
pub mod location;
pub mod request;

pub use error::{Error, Result};
pub use group::{GroupEventState, RequestResultInfo};
pub use location::StorageType;
pub use request::{
    CLAIMED_STATUSES, FileRequest, NewFileRequest, RUNNING_OR_DELAYED_STATUSES, RUNNING_STATUSES,
    RequestId, RequestKind, RequestStatus,
};

/// Maximum number of checksums accepted in a single submitted batch.
pub const MAX_BATCH_SIZE: usize = 1000;

/// Maximum length of a checksum string.
pub const MAX_CHECKSUM_LEN: usize = 128;
