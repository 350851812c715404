//! Common test utilities and fixtures.

pub mod engine;
pub mod location;
pub mod server;

#[allow(unused_imports)]
pub use engine::*;
#[allow(unused_imports)]
pub use location::*;
#[allow(unused_imports)]
pub use server::*;
