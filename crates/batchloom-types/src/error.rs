use thiserror::Error;

/// Errors raised by a storage backend inside one unit of work.
///
/// Every variant is treated as transient by the unit-of-work runner.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database connection error: {0}")]
    Connection(String),

    #[error("storage busy: {0}")]
    Busy(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Coarse classification of [`SchedulerError`], for total matches at the edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Storage,
    MalformedWorkflow,
    NotFound,
    InvalidState,
    Resource,
    Execution,
    Config,
}

impl ErrorKind {
    /// Whether retrying the same request later can succeed.
    pub fn is_retryable(self) -> bool {
        match self {
            Self::Storage | Self::Resource | Self::Execution => true,
            Self::MalformedWorkflow | Self::NotFound | Self::InvalidState | Self::Config => false,
        }
    }
}

/// Errors surfaced by the scheduling engine.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("storage exhausted after {attempts} attempts: {source}")]
    StorageExhausted {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("malformed workflow: {0}")]
    MalformedWorkflow(String),

    #[error("job {job} failed: {message}")]
    JobFailed { job: u64, message: String },

    #[error("job {0} not found")]
    JobNotFound(u64),

    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("invalid transition for task {task}: {event} while {from}")]
    InvalidTransition {
        task: String,
        from: String,
        event: String,
    },

    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("dispatch error: {0}")]
    Dispatch(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::StorageExhausted { .. } => ErrorKind::Storage,
            Self::MalformedWorkflow(_) => ErrorKind::MalformedWorkflow,
            Self::JobFailed { .. } => ErrorKind::Execution,
            Self::JobNotFound(_) | Self::TaskNotFound(_) => ErrorKind::NotFound,
            Self::InvalidTransition { .. } => ErrorKind::InvalidState,
            Self::ResourceUnavailable(_) => ErrorKind::Resource,
            Self::Dispatch(_) => ErrorKind::Execution,
            Self::Config(_) => ErrorKind::Config,
        }
    }
}
