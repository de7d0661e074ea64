//! In-memory state of a job owned by a driver in this process.

use batchloom_types::error::ErrorKind;
use batchloom_types::ids::JobId;
use batchloom_types::job::{Job, JobStatus};
use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;

/// Why a job driver stopped, when it was not a normal end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct JobFailure {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct JobEnd {
    pub status: JobStatus,
    pub failure: Option<JobFailure>,
}

/// Committed view of one job.
///
/// Only the job's driver writes `job`, and only after the change has been
/// committed; everyone else reads.
#[derive(Debug)]
pub(crate) struct LiveJob {
    pub id: JobId,
    pub job: RwLock<Job>,
    /// Cancelled to kill the job.
    pub abort: CancellationToken,
    end: watch::Sender<Option<JobEnd>>,
}

impl LiveJob {
    pub fn new(job: Job) -> Self {
        let (end, _) = watch::channel(None);
        Self {
            id: job.id.clone(),
            job: RwLock::new(job),
            abort: CancellationToken::new(),
            end,
        }
    }

    pub fn finish(&self, end: JobEnd) {
        self.end.send_replace(Some(end));
    }

    /// Whether the driver has stopped.
    pub fn is_ended(&self) -> bool {
        self.end.borrow().is_some()
    }

    /// Wait for the driver to stop.
    pub async fn ended(&self) -> Option<JobEnd> {
        let mut rx = self.end.subscribe();
        let end = rx.wait_for(Option::is_some).await.ok()?;
        (*end).clone()
    }
}
