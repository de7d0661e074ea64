//! Job and task persistence operations available inside a unit of work.

use std::future::Future;

use batchloom_types::error::StoreError;
use batchloom_types::ids::TaskId;
use batchloom_types::job::{Job, JobSummary};
use batchloom_types::task::Task;

/// Operations on one open storage session.
///
/// Writes are only durable once the owning backend commits the session.
pub trait JobSession: Send {
    /// Reserve the next job id. Ids are never handed out twice.
    fn next_job_id(&mut self) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Insert or update the job record (header fields only, not tasks).
    fn save_job(&mut self, job: &Job) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Insert or replace task records, keyed by task id.
    ///
    /// Replaying the same records is a no-op, which makes graph delta
    /// application idempotent after a crash.
    fn upsert_tasks(&mut self, tasks: &[Task])
    -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Load a job with all its tasks.
    fn load_job(&mut self, id: u64)
    -> impl Future<Output = Result<Option<Job>, StoreError>> + Send;

    fn load_task(
        &mut self,
        id: &TaskId,
    ) -> impl Future<Output = Result<Option<Task>, StoreError>> + Send;

    /// Job headers, newest first. `unfinished_only` skips terminal jobs.
    fn list_jobs(
        &mut self,
        unfinished_only: bool,
    ) -> impl Future<Output = Result<Vec<JobSummary>, StoreError>> + Send;
}
