//! Storage location implementations.

pub mod filesystem;
