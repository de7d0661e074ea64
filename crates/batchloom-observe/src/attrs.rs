//! Span attribute keys.
//!
//! Usable as constant field names: `tracing::info_span!("job", { JOB_ID } = id)`.

/// Numeric job id.
pub const JOB_ID: &str = "batchloom.job.id";

/// Job display name.
pub const JOB_NAME: &str = "batchloom.job.name";

/// Readable task name, including loop and replica suffixes.
pub const TASK_NAME: &str = "batchloom.task.name";

/// Final job status.
pub const JOB_STATUS: &str = "batchloom.job.status";

/// CLI command being run.
pub const COMMAND: &str = "batchloom.command";
