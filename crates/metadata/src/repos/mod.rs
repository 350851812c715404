//! Repository traits for request store operations.

pub mod cache_files;
pub mod file_refs;
pub mod groups;
pub mod jobs;
pub mod locks;
pub mod requests;

pub use cache_files::CacheFileRepo;
pub use file_refs::FileRefRepo;
pub use groups::GroupRepo;
pub use jobs::{JobRepo, JobState};
pub use locks::LockRepo;
pub use requests::{RequestPatch, RequestRepo};
