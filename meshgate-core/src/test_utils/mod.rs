//! Test utilities shared by unit tests, integration tests and benches

pub mod async_helpers;
pub mod fixtures;

pub use async_helpers::*;
pub use fixtures::*;
