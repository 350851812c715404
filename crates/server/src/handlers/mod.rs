//! HTTP request handlers.

pub mod admin;
pub mod health;
pub mod requests;

pub use admin::*;
pub use health::*;
pub use requests::*;
