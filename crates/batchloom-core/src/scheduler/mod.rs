//! The scheduling engine.
//!
//! [`Scheduler`] is the composition root: it validates and persists submitted
//! jobs, then hands each one to its own driver task. A driver makes one
//! decision pass at a time for its job, so transitions within a job are
//! linearizable, while drivers for different jobs run concurrently.
//!
//! All persistence goes through the [`UnitOfWorkRunner`], execution through
//! the [`ExecutionSupervisor`], and capacity through a [`ResourceAllocator`].

mod clock;
mod driver;
mod live;
mod transition;


use std::sync::Arc;
use std::time::Duration;

use batchloom_types::config::SchedulerConfig;
use batchloom_types::error::{ErrorKind, SchedulerError};
use batchloom_types::event::SchedulerEvent;
use batchloom_types::ids::{JobId, TaskId};
use batchloom_types::job::{Job, JobStatus, JobSubmission, JobSummary};
use batchloom_types::task::{FailureCause, Task, TaskResult, TaskStatus};
use dashmap::DashMap;
use tokio::sync::broadcast;

pub use clock::Clock;

use self::driver::JobDriver;
use self::live::LiveJob;
use self::transition::Transition;
use crate::event::EventBus;
use crate::execution::{ExecutionSupervisor, ResourceAllocator, WorkerDispatch};
use crate::graph::{build_job, validate_submission};
use crate::repository::{JobSession, TransactionalBackend};
use crate::task::{RestartPolicy, TaskLifecycle};
use crate::unit_of_work::UnitOfWorkRunner;

/// State shared by the scheduler handle and every job driver.
pub(crate) struct Shared<B, A, D> {
    pub(crate) runner: UnitOfWorkRunner<B>,
    pub(crate) allocator: Arc<A>,
    pub(crate) dispatch: Arc<D>,
    pub(crate) supervisor: ExecutionSupervisor,
    pub(crate) restart: RestartPolicy,
    pub(crate) default_timeout: Duration,
    pub(crate) events: EventBus,
    pub(crate) clock: Clock,
    jobs: DashMap<u64, Arc<LiveJob>>,
}

impl<B, A, D> Shared<B, A, D> {
    /// Drop an ended job from the live table. Waiters already holding it
    /// still see its end.
    pub(crate) fn release(&self, live: &LiveJob) {
        self.jobs.remove_if(&live.id.id, |_, held| held.is_ended());
    }
}

/// Handle to the scheduling engine. Cheap to clone.
pub struct Scheduler<B, A, D> {
    shared: Arc<Shared<B, A, D>>,
}

impl<B, A, D> Clone for Scheduler<B, A, D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B, A, D> std::fmt::Debug for Scheduler<B, A, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("live_jobs", &self.shared.jobs.len())
            .field("events", &self.shared.events)
            .finish()
    }
}

impl<B, A, D> Scheduler<B, A, D>
where
    B: TransactionalBackend,
    A: ResourceAllocator,
    D: WorkerDispatch,
{
    /// Build a scheduler. Must be called from within a tokio runtime.
    pub fn new(
        backend: Arc<B>,
        allocator: A,
        dispatch: D,
        config: &SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        let runner = UnitOfWorkRunner::new(backend, config.transactions.clone())?;
        Ok(Self {
            shared: Arc::new(Shared {
                runner,
                allocator: Arc::new(allocator),
                dispatch: Arc::new(dispatch),
                supervisor: ExecutionSupervisor::new(config.execution.kill_grace()),
                restart: RestartPolicy::from_config(&config.restart),
                default_timeout: config.execution.default_timeout(),
                events: EventBus::new(config.events.capacity),
                clock: Clock::start(),
                jobs: DashMap::new(),
            }),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.shared.events.subscribe()
    }

    pub fn runner(&self) -> &UnitOfWorkRunner<B> {
        &self.shared.runner
    }

    pub fn allocator(&self) -> &A {
        &self.shared.allocator
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Validate, persist and start a job.
    ///
    /// Structural problems are reported here as
    /// [`SchedulerError::MalformedWorkflow`] and nothing is stored.
    pub async fn submit_job(&self, submission: JobSubmission) -> Result<JobId, SchedulerError> {
        validate_submission(&submission)?;

        let number = self
            .shared
            .runner
            .run_read_write(|session| Box::pin(async move { session.next_job_id().await }))
            .await?;
        let job = build_job(
            JobId::new(number, submission.name.clone()),
            &submission,
            self.shared.clock.now(),
        )?;

        let record = Arc::new(job.clone());
        self.shared
            .runner
            .run_read_write(move |session| {
                let job = Arc::clone(&record);
                Box::pin(async move {
                    session.save_job(&job).await?;
                    let tasks: Vec<Task> = job.tasks().cloned().collect();
                    session.upsert_tasks(&tasks).await
                })
            })
            .await?;

        let id = job.id.clone();
        tracing::info!(job = %id, owner = %job.owner, tasks = job.task_count(), "job submitted");
        self.shared.events.publish(SchedulerEvent::JobStatusChanged {
            job_id: id.clone(),
            status: job.status,
            at: job.submitted_at,
        });
        self.spawn_driver(Arc::new(LiveJob::new(job)));
        Ok(id)
    }

    /// Kill a job: running attempts are cancelled and every unfinished task
    /// ends ABORTED. Killing a terminal job is a no-op.
    pub async fn abort_job(&self, job: u64) -> Result<(), SchedulerError> {
        if let Some(live) = self.live(job) {
            if !live.is_ended() {
                tracing::info!(job = %live.id, "abort requested");
                live.abort.cancel();
            }
            return Ok(());
        }

        // No driver here; end the stored record directly.
        let stored = self.load_job(job).await?;
        if stored.is_terminal() {
            return Ok(());
        }
        let now = self.shared.clock.now();
        let cause = FailureCause::Aborted {
            reason: "job killed".to_string(),
        };
        let mut aborted = Vec::new();
        for task in stored.tasks().filter(|t| !t.is_terminal()) {
            let mut next = task.clone();
            TaskLifecycle::abort(&mut next, cause.clone(), now)?;
            aborted.push(next);
        }
        tracing::info!(job = %stored.id, tasks = aborted.len(), "killing stored job");
        let live = LiveJob::new(stored);
        self.shared
            .commit(&live, Transition::ending(aborted, JobStatus::Killed, None), now)
            .await
    }

    /// Resume every unfinished job found in storage.
    ///
    /// Attempts that were RUNNING when the previous process died go back to
    /// PENDING without counting against their retry budget.
    pub async fn recover(&self) -> Result<Vec<JobId>, SchedulerError> {
        let unfinished = self
            .shared
            .runner
            .run_read_only(|session| Box::pin(async move { session.list_jobs(true).await }))
            .await?;

        let mut resumed = Vec::new();
        for summary in unfinished.into_iter().rev() {
            if self.shared.jobs.contains_key(&summary.id.id) {
                continue;
            }
            let job = self.load_job(summary.id.id).await?;
            let mut lost = Vec::new();
            for task in job.tasks().filter(|t| t.status == TaskStatus::Running) {
                let mut next = task.clone();
                TaskLifecycle::requeue_lost(&mut next)?;
                lost.push(next);
            }

            let live = Arc::new(LiveJob::new(job));
            if !lost.is_empty() {
                tracing::warn!(job = %live.id, tasks = lost.len(), "requeueing attempts lost with the previous process");
                self.shared
                    .commit(&live, Transition::tasks(lost), self.shared.clock.now())
                    .await?;
            }
            resumed.push(live.id.clone());
            self.spawn_driver(live);
        }

        tracing::info!(jobs = resumed.len(), "recovery complete");
        Ok(resumed)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Result of a task: `None` while it is not terminal.
    pub async fn get_result(&self, task: &TaskId) -> Result<Option<TaskResult>, SchedulerError> {
        if let Some(live) = self.live(task.job.id) {
            let job = live.job.read().await;
            return job
                .task(task)
                .map(|t| t.result.clone())
                .ok_or_else(|| SchedulerError::TaskNotFound(task.to_string()));
        }

        let id = task.clone();
        let stored = self
            .shared
            .runner
            .run_read_only(move |session| {
                let id = id.clone();
                Box::pin(async move { session.load_task(&id).await })
            })
            .await?;
        stored
            .map(|t| t.result)
            .ok_or_else(|| SchedulerError::TaskNotFound(task.to_string()))
    }

    /// Current state of a job and all its tasks.
    pub async fn job_snapshot(&self, job: u64) -> Result<Job, SchedulerError> {
        if let Some(live) = self.live(job) {
            return Ok(live.job.read().await.clone());
        }
        self.load_job(job).await
    }

    /// Wait until the job's driver stops and return the final status.
    ///
    /// A job ended by a malformed flow directive yields
    /// [`SchedulerError::MalformedWorkflow`]; one whose driver gave up for
    /// another reason yields [`SchedulerError::JobFailed`]. For a job no
    /// driver in this process owns, the stored status is returned as is.
    pub async fn wait_job(&self, job: u64) -> Result<JobStatus, SchedulerError> {
        let Some(live) = self.live(job) else {
            let stored = self.load_job(job).await?;
            return match (stored.status, stored.error) {
                (JobStatus::Failed, Some(message)) => Err(job_failure(job, message)),
                (status, _) => Ok(status),
            };
        };

        let end = live.ended().await.ok_or(SchedulerError::JobNotFound(job))?;
        match end.failure {
            None => Ok(end.status),
            Some(failure) if failure.kind == ErrorKind::MalformedWorkflow => {
                Err(job_failure(job, failure.message))
            }
            Some(failure) => Err(SchedulerError::JobFailed {
                job,
                message: failure.message,
            }),
        }
    }

    /// Whether a driver in this process still owns the job. Ended jobs are
    /// dropped from memory and answered from storage.
    pub fn is_live(&self, job: u64) -> bool {
        self.shared.jobs.contains_key(&job)
    }

    /// Stored job headers, newest first.
    pub async fn list_jobs(&self, unfinished_only: bool) -> Result<Vec<JobSummary>, SchedulerError> {
        self.shared
            .runner
            .run_read_only(move |session| {
                Box::pin(async move { session.list_jobs(unfinished_only).await })
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn live(&self, job: u64) -> Option<Arc<LiveJob>> {
        self.shared.jobs.get(&job).map(|entry| Arc::clone(entry.value()))
    }

    async fn load_job(&self, job: u64) -> Result<Job, SchedulerError> {
        self.shared
            .runner
            .run_read_only(move |session| Box::pin(async move { session.load_job(job).await }))
            .await?
            .ok_or(SchedulerError::JobNotFound(job))
    }

    fn spawn_driver(&self, live: Arc<LiveJob>) {
        self.shared.jobs.insert(live.id.id, Arc::clone(&live));
        let driver = JobDriver::new(Arc::clone(&self.shared), live);
        tokio::spawn(driver.run());
    }
}

/// Error for a job that ended FAILED with `message` recorded. The message of
/// a malformed workflow keeps its kind when read back from storage.
fn job_failure(job: u64, message: String) -> SchedulerError {
    let marker = SchedulerError::MalformedWorkflow(String::new()).to_string();
    match message.strip_prefix(&marker) {
        Some(detail) => SchedulerError::MalformedWorkflow(detail.to_string()),
        None => SchedulerError::JobFailed { job, message },
    }
}
