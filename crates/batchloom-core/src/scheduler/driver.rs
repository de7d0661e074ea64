//! Per-job scheduling loop.
//!
//! Each pass settles the graph (SUBMITTED tasks are released, tasks behind a
//! failed dependency fail), starts every ready task, then waits for the first
//! of: an attempt completing, the job being killed, or the next delayed task
//! becoming eligible. Completions are routed through the task state machine
//! and, on success, the flow resolver.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use batchloom_types::error::{ErrorKind, SchedulerError};
use batchloom_types::event::SchedulerEvent;
use batchloom_types::executable::{TaskOutput, WorkerHandle};
use batchloom_types::ids::TaskId;
use batchloom_types::job::JobStatus;
use batchloom_types::task::{FailureCause, Task, TaskStatus};
use chrono::{DateTime, Utc};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use super::Shared;
use super::live::{JobEnd, JobFailure, LiveJob};
use super::transition::{Expansion, Transition};
use crate::execution::{ExecutionFailure, ResourceAllocator, SupervisionOutcome, WorkerDispatch};
use crate::flow::{FlowResolver, materialize};
use crate::repository::{JobSession, TransactionalBackend};
use crate::task::{FaultDisposition, Readiness, TaskLifecycle};

/// An attempt that stopped, as reported by its bookkeeping task.
struct Completion {
    task: TaskId,
    outcome: SupervisionOutcome<Result<TaskOutput, ExecutionFailure>>,
}

/// Result of one launch pass.
struct Launch {
    /// Some task changed state.
    progressed: bool,
    /// Earliest future `not_before` among ready tasks.
    wake_at: Option<DateTime<Utc>>,
}

pub(crate) struct JobDriver<B, A, D> {
    shared: Arc<Shared<B, A, D>>,
    live: Arc<LiveJob>,
    in_flight: JoinSet<Completion>,
    /// Caller-side cancel handle of every running attempt.
    running: HashMap<TaskId, CancellationToken>,
    failure: Option<JobFailure>,
}

impl<B, A, D> JobDriver<B, A, D>
where
    B: TransactionalBackend,
    A: ResourceAllocator,
    D: WorkerDispatch,
{
    pub(crate) fn new(shared: Arc<Shared<B, A, D>>, live: Arc<LiveJob>) -> Self {
        Self {
            shared,
            live,
            in_flight: JoinSet::new(),
            running: HashMap::new(),
            failure: None,
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::debug!(job = %self.live.id, "job driver started");
        if let Err(err) = self.drive().await {
            self.halt(err).await;
        }

        let status = self.live.job.read().await.status;
        tracing::info!(job = %self.live.id, %status, "job ended");
        self.live.finish(JobEnd {
            status,
            failure: self.failure.take(),
        });
        self.shared.release(&self.live);
    }

    async fn drive(&mut self) -> Result<(), SchedulerError> {
        loop {
            if self.live.abort.is_cancelled() && !self.is_ended().await {
                let cause = FailureCause::Aborted {
                    reason: "job killed".to_string(),
                };
                self.terminate(JobStatus::Killed, cause, None, Vec::new()).await?;
            }
            if self.is_ended().await {
                self.drain().await;
                return Ok(());
            }

            self.settle().await?;
            if self.is_ended().await {
                continue;
            }

            let launch = self.launch_ready().await?;
            if self.is_ended().await {
                continue;
            }
            if self.in_flight.is_empty() && launch.wake_at.is_none() {
                if launch.progressed {
                    continue;
                }
                let message = "no runnable task left but the job is not finished".to_string();
                tracing::error!(job = %self.live.id, "{message}");
                self.failure = Some(JobFailure {
                    kind: ErrorKind::InvalidState,
                    message: message.clone(),
                });
                let cause = FailureCause::JobFailed {
                    message: message.clone(),
                };
                self.terminate(JobStatus::Failed, cause, Some(message), Vec::new())
                    .await?;
                continue;
            }

            let wait = launch
                .wake_at
                .map(|at| self.shared.clock.until(at))
                .unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = self.live.abort.cancelled() => {}
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    self.on_completion(joined).await?;
                }
                _ = tokio::time::sleep(wait), if launch.wake_at.is_some() => {}
            }
        }
    }

    async fn is_ended(&self) -> bool {
        self.live.job.read().await.is_terminal()
    }

    // -----------------------------------------------------------------------
    // Decision pass
    // -----------------------------------------------------------------------

    /// Release SUBMITTED tasks and fail those behind a failed dependency,
    /// until nothing changes.
    async fn settle(&mut self) -> Result<(), SchedulerError> {
        loop {
            let now = self.shared.clock.now();
            let changes = {
                let job = self.live.job.read().await;
                let mut changes = Vec::new();
                for task in job.tasks() {
                    if !matches!(task.status, TaskStatus::Submitted | TaskStatus::Pending) {
                        continue;
                    }
                    let mut next = task.clone();
                    match TaskLifecycle::readiness(&job, task) {
                        Readiness::Blocked(dependency) => {
                            TaskLifecycle::fail_dependency(&mut next, &dependency, now)?;
                        }
                        _ if task.status == TaskStatus::Submitted => TaskLifecycle::release(&mut next)?,
                        _ => continue,
                    }
                    changes.push(next);
                }
                changes
            };
            if changes.is_empty() {
                return Ok(());
            }
            self.commit(Transition::tasks(changes)).await?;
        }
    }

    async fn launch_ready(&mut self) -> Result<Launch, SchedulerError> {
        let now = self.shared.clock.now();
        let (ready, wake_at) = {
            let job = self.live.job.read().await;
            let mut ready = Vec::new();
            let mut wake_at: Option<DateTime<Utc>> = None;
            for task in job.tasks().filter(|t| t.status == TaskStatus::Pending) {
                if TaskLifecycle::readiness(&job, task) != Readiness::Ready {
                    continue;
                }
                match task.not_before {
                    Some(at) if at > now => {
                        wake_at = Some(wake_at.map_or(at, |earliest| earliest.min(at)));
                    }
                    _ => ready.push(task.clone()),
                }
            }
            (ready, wake_at)
        };

        let mut progressed = false;
        for task in ready {
            if self.live.abort.is_cancelled() || self.is_ended().await {
                break;
            }
            progressed |= self.launch(task).await?;
        }
        Ok(Launch {
            progressed,
            wake_at,
        })
    }

    /// Move one ready task to RUNNING and hand it to the supervisor.
    ///
    /// Waiting for capacity is the only place the loop blocks on the outside
    /// world; a kill request interrupts the wait.
    async fn launch(&mut self, task: Task) -> Result<bool, SchedulerError> {
        let mut next = task;
        TaskLifecycle::start(&mut next, self.shared.clock.now())?;

        let acquired = tokio::select! {
            biased;
            _ = self.live.abort.cancelled() => return Ok(false),
            acquired = self.shared.allocator.acquire(next.requirements) => acquired,
        };
        let worker = match acquired {
            Ok(worker) => worker,
            Err(err) => {
                tracing::warn!(task = %next.id, error = %err, "no capacity for task");
                let cause = FailureCause::ResourceUnavailable {
                    message: err.to_string(),
                };
                self.record_fault(next, cause).await?;
                return Ok(true);
            }
        };

        if let Err(err) = self.commit(Transition::tasks(vec![next.clone()])).await {
            self.shared.allocator.release(worker).await;
            return Err(err);
        }
        self.spawn_attempt(next, worker);
        Ok(true)
    }

    fn spawn_attempt(&mut self, task: Task, worker: WorkerHandle) {
        let container = task.executable.with_nodes(worker.nodes.clone());
        let timeout = task
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.shared.default_timeout);
        let dispatch = Arc::clone(&self.shared.dispatch);
        let lease = worker.clone();
        let label = task.id.to_string();

        let execution = self.shared.supervisor.submit_with_timeout(
            move |interrupt| async move { dispatch.dispatch(container, lease, interrupt).await },
            timeout,
            move || {
                tracing::warn!(
                    task = %label,
                    timeout_ms = timeout.as_millis() as u64,
                    "attempt exceeded its deadline"
                );
            },
        );
        self.running.insert(task.id.clone(), execution.canceller());

        let allocator = Arc::clone(&self.shared.allocator);
        let id = task.id.clone();
        self.in_flight.spawn(async move {
            let outcome = execution.await;
            allocator.release(worker).await;
            Completion { task: id, outcome }
        });
        tracing::debug!(task = %task.id, attempt = task.attempts, "attempt dispatched");
    }

    // -----------------------------------------------------------------------
    // Completions
    // -----------------------------------------------------------------------

    async fn on_completion(&mut self, joined: Result<Completion, JoinError>) -> Result<(), SchedulerError> {
        let Completion { task: id, outcome } = match joined {
            Ok(completion) => completion,
            Err(err) => {
                tracing::error!(job = %self.live.id, error = %err, "attempt bookkeeping failed");
                return Ok(());
            }
        };
        self.running.remove(&id);
        if self.live.abort.is_cancelled() {
            return Ok(());
        }

        let task = {
            let job = self.live.job.read().await;
            job.task(&id)
                .cloned()
                .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))?
        };
        if task.status != TaskStatus::Running {
            return Ok(());
        }

        match outcome {
            SupervisionOutcome::Completed(Ok(output)) => self.on_success(task, output).await,
            SupervisionOutcome::Completed(Err(failure)) => {
                let cause = FailureCause::Application {
                    message: failure.message,
                };
                self.record_fault(task, cause).await
            }
            SupervisionOutcome::TimedOut { after } => {
                let cause = FailureCause::Timeout {
                    after_ms: after.as_millis() as u64,
                };
                self.record_fault(task, cause).await
            }
            SupervisionOutcome::Crashed { message } => {
                self.record_fault(task, FailureCause::Application { message }).await
            }
            SupervisionOutcome::Cancelled => {
                let mut next = task;
                let cause = FailureCause::Aborted {
                    reason: "attempt cancelled".to_string(),
                };
                TaskLifecycle::abort(&mut next, cause, self.shared.clock.now())?;
                self.commit(Transition::tasks(vec![next])).await
            }
        }
    }

    /// Finish the task and grow the graph as its flow directive says, in a
    /// single commit.
    async fn on_success(&mut self, task: Task, output: TaskOutput) -> Result<(), SchedulerError> {
        let now = self.shared.clock.now();
        let mut next = task;
        TaskLifecycle::finish(&mut next, output, now)?;

        let resolved = {
            let job = self.live.job.read().await;
            FlowResolver::evaluate_flow_action(&job, &next, now)
                .map(|delta| (materialize(&job, &delta), delta))
        };
        let (records, delta) = match resolved {
            Ok(resolved) => resolved,
            Err(err) if err.kind() == ErrorKind::MalformedWorkflow => {
                let message = err.to_string();
                tracing::error!(job = %self.live.id, task = %next.id, error = %message, "flow directive rejected");
                self.failure = Some(JobFailure {
                    kind: ErrorKind::MalformedWorkflow,
                    message: message.clone(),
                });
                let cause = FailureCause::JobFailed {
                    message: message.clone(),
                };
                return self
                    .terminate(JobStatus::Failed, cause, Some(message), vec![next])
                    .await;
            }
            Err(err) => return Err(err),
        };

        let expansion = (!delta.is_empty()).then(|| Expansion {
            origin: delta.origin.clone(),
            action: delta.action.clone(),
            added: delta.added_tasks.iter().map(|t| t.id.clone()).collect(),
        });
        if let Some(expansion) = &expansion {
            tracing::info!(
                task = %next.id,
                action = %expansion.action,
                added = expansion.added.len(),
                "graph expanded"
            );
        }

        let mut tasks: Vec<Task> = records.into_iter().filter(|t| t.id != next.id).collect();
        tasks.push(next);
        self.commit(Transition {
            tasks,
            expansion,
            ..Transition::default()
        })
        .await
    }

    /// Count a failed attempt. A spent retry budget on a task flagged
    /// `cancel_job_on_error` cancels the whole job.
    async fn record_fault(&mut self, task: Task, cause: FailureCause) -> Result<(), SchedulerError> {
        let mut next = task;
        let disposition = TaskLifecycle::fault(&mut next, cause, self.shared.clock.now(), &self.shared.restart)?;
        match disposition {
            FaultDisposition::Retry { not_before } => {
                tracing::debug!(
                    task = %next.id,
                    attempt = next.attempts,
                    %not_before,
                    "attempt failed, will retry"
                );
                self.commit(Transition::tasks(vec![next])).await
            }
            FaultDisposition::Exhausted => {
                tracing::warn!(task = %next.id, attempts = next.attempts, "task is faulty");
                if next.cancel_job_on_error {
                    let reason = format!("task {} failed", next.id.readable_name());
                    let cause = FailureCause::Aborted {
                        reason: reason.clone(),
                    };
                    self.terminate(JobStatus::Canceled, cause, Some(reason), vec![next])
                        .await
                } else {
                    self.commit(Transition::tasks(vec![next])).await
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Ending
    // -----------------------------------------------------------------------

    /// End the job with `status`: cancel running attempts and abort every
    /// unfinished task with `cause`. `extra` records are committed alongside.
    async fn terminate(
        &mut self,
        status: JobStatus,
        cause: FailureCause,
        error: Option<String>,
        extra: Vec<Task>,
    ) -> Result<(), SchedulerError> {
        for token in self.running.values() {
            token.cancel();
        }

        let now = self.shared.clock.now();
        let changes = {
            let job = self.live.job.read().await;
            let settled: HashSet<TaskId> = extra.iter().map(|t| t.id.clone()).collect();
            let mut changes = extra;
            for task in job.tasks() {
                if task.is_terminal() || settled.contains(&task.id) {
                    continue;
                }
                let mut next = task.clone();
                TaskLifecycle::abort(&mut next, cause.clone(), now)?;
                changes.push(next);
            }
            changes
        };

        tracing::info!(job = %self.live.id, %status, aborted = changes.len(), "ending job");
        self.commit(Transition::ending(changes, status, error)).await?;
        self.drain().await;
        Ok(())
    }

    /// Wait for every in-flight attempt to report, so capacity is returned.
    async fn drain(&mut self) {
        while let Some(joined) = self.in_flight.join_next().await {
            if let Ok(completion) = joined {
                self.running.remove(&completion.task);
            }
        }
    }

    /// The driver cannot go on (storage gave out). Mark the job failed in
    /// memory and, if storage allows, on disk.
    async fn halt(&mut self, err: SchedulerError) {
        tracing::error!(job = %self.live.id, error = %err, "job driver stopped");
        for token in self.running.values() {
            token.cancel();
        }
        self.drain().await;

        let now = self.shared.clock.now();
        let message = err.to_string();
        let header = {
            let mut job = self.live.job.write().await;
            job.status = JobStatus::Failed;
            job.error = Some(message.clone());
            job.finished_at = Some(now);
            job.header()
        };
        let record = header.clone();
        let persisted = self
            .shared
            .runner
            .run_read_write(move |session| {
                let header = record.clone();
                Box::pin(async move { session.save_job(&header).await })
            })
            .await;
        if let Err(persist) = persisted {
            tracing::warn!(job = %self.live.id, error = %persist, "could not record job failure");
        }

        self.shared.events.publish(SchedulerEvent::JobStatusChanged {
            job_id: header.id,
            status: JobStatus::Failed,
            at: now,
        });
        self.failure.get_or_insert(JobFailure {
            kind: err.kind(),
            message,
        });
    }

    async fn commit(&self, batch: Transition) -> Result<(), SchedulerError> {
        self.shared
            .commit(&self.live, batch, self.shared.clock.now())
            .await
    }
}
