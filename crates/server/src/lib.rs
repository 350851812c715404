//! File request orchestration server.
//!
//! This crate provides:
//! - The orchestration engine (arbitration, groups, scheduling, jobs)
//! - Batch submission endpoints for storage, deletion, copy and cache requests
//! - Group and operator endpoints
//! - Prometheus metrics

pub mod engine;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod routes;
pub mod state;

pub use engine::{BatchReceipt, Engine, EngineError, EngineResult};
pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
