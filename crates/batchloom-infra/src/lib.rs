//! Infrastructure layer for batchloom.
//!
//! Implements the storage port traits of `batchloom-core` on SQLite, loads
//! the scheduler configuration from the data directory, and provides a
//! process-spawning executable resolver for local workers.

pub mod config;
pub mod filesystem;
pub mod sqlite;
pub mod worker;
