//! Tracing setup and span attribute keys shared by the batchloom binaries.

pub mod attrs;
pub mod tracing_setup;
