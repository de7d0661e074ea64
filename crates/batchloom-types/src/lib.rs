//! Shared domain types for batchloom.
//!
//! Jobs, tasks and their identities, flow directives and graph deltas,
//! executable containers, status events, configuration and the error
//! taxonomy. No infrastructure dependencies beyond serde, chrono, uuid,
//! thiserror and base64.

pub mod config;
pub mod error;
pub mod event;
pub mod executable;
pub mod flow;
pub mod ids;
pub mod job;
pub mod task;
