//! SQLite storage layer.
//!
//! The transactional backend behind the scheduler, with WAL mode and split
//! read/write connection pools.

pub mod job_store;
pub mod pool;

pub use job_store::{SqliteBackend, SqliteSession};
pub use pool::DatabasePool;
