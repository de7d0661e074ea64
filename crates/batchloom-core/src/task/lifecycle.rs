//! Task state machine.
//!
//! ```text
//! SUBMITTED -> PENDING -> RUNNING -> FINISHED
//!                 ^          |
//!                 +----------+-> FAULTY (retry budget spent)
//! SUBMITTED/PENDING -> FAILED (dependency did not finish)
//! any non-terminal  -> ABORTED
//! ```
//!
//! Every function takes the task by `&mut` and either applies the transition
//! or returns [`SchedulerError::InvalidTransition`] leaving it untouched. The
//! scheduler runs them on a copy, commits the copy, and only then swaps it
//! into the live job.

use batchloom_types::error::SchedulerError;
use batchloom_types::executable::TaskOutput;
use batchloom_types::ids::TaskId;
use batchloom_types::job::Job;
use batchloom_types::task::{FailureCause, Task, TaskResult, TaskStatus};
use chrono::{DateTime, Utc};

use super::restart::RestartPolicy;

/// What happened to a task after an attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultDisposition {
    /// Back to PENDING; eligible again at `not_before`.
    Retry { not_before: DateTime<Utc> },
    /// Retry budget spent; the task is terminal FAULTY.
    Exhausted,
}

/// Dependency state of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Waiting,
    /// A dependency ended without finishing.
    Blocked(TaskId),
}

/// Stateless transition functions.
pub struct TaskLifecycle;

impl TaskLifecycle {
    /// SUBMITTED -> PENDING.
    pub fn release(task: &mut Task) -> Result<(), SchedulerError> {
        Self::expect(task, &[TaskStatus::Submitted], "release")?;
        task.status = TaskStatus::Pending;
        Ok(())
    }

    /// PENDING -> RUNNING, opening a new attempt.
    pub fn start(task: &mut Task, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        Self::expect(task, &[TaskStatus::Pending], "start")?;
        task.status = TaskStatus::Running;
        task.attempts += 1;
        task.not_before = None;
        task.started_at = Some(now);
        Ok(())
    }

    /// RUNNING -> FINISHED.
    pub fn finish(
        task: &mut Task,
        output: TaskOutput,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        Self::expect(task, &[TaskStatus::Running], "finish")?;
        task.status = TaskStatus::Finished;
        task.result = Some(TaskResult::Success { output });
        task.finished_at = Some(now);
        Ok(())
    }

    /// RUNNING -> PENDING while attempts remain, else terminal FAULTY.
    pub fn fault(
        task: &mut Task,
        cause: FailureCause,
        now: DateTime<Utc>,
        policy: &RestartPolicy,
    ) -> Result<FaultDisposition, SchedulerError> {
        Self::expect(task, &[TaskStatus::Running], "fault")?;
        if task.attempts < task.max_executions_on_failure {
            let wait = policy.waiting_time(task.attempts.saturating_sub(1));
            let not_before = now + chrono::Duration::from_std(wait).unwrap_or(chrono::Duration::zero());
            task.status = TaskStatus::Pending;
            task.last_failure = Some(cause);
            task.not_before = Some(not_before);
            return Ok(FaultDisposition::Retry { not_before });
        }
        task.status = TaskStatus::Faulty;
        task.last_failure = Some(cause.clone());
        task.result = Some(TaskResult::Failure { cause });
        task.finished_at = Some(now);
        Ok(FaultDisposition::Exhausted)
    }

    /// SUBMITTED/PENDING -> FAILED because `dependency` did not finish.
    pub fn fail_dependency(
        task: &mut Task,
        dependency: &TaskId,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        Self::expect(task, &[TaskStatus::Submitted, TaskStatus::Pending], "fail_dependency")?;
        task.status = TaskStatus::Failed;
        task.result = Some(TaskResult::Failure {
            cause: FailureCause::DependencyFailed {
                dependency: dependency.readable_name(),
            },
        });
        task.finished_at = Some(now);
        Ok(())
    }

    /// Any non-terminal status -> ABORTED.
    pub fn abort(task: &mut Task, cause: FailureCause, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        Self::expect(
            task,
            &[TaskStatus::Submitted, TaskStatus::Pending, TaskStatus::Running],
            "abort",
        )?;
        task.status = TaskStatus::Aborted;
        task.result = Some(TaskResult::Failure { cause });
        task.finished_at = Some(now);
        Ok(())
    }

    /// RUNNING -> PENDING for an attempt lost with its process (crash recovery).
    ///
    /// The lost attempt is not counted.
    pub fn requeue_lost(task: &mut Task) -> Result<(), SchedulerError> {
        Self::expect(task, &[TaskStatus::Running], "requeue")?;
        task.status = TaskStatus::Pending;
        task.attempts = task.attempts.saturating_sub(1);
        task.started_at = None;
        Ok(())
    }

    /// Dependency state of `task` within `job`.
    pub fn readiness(job: &Job, task: &Task) -> Readiness {
        let mut waiting = false;
        for dep in &task.dependencies {
            match job.task(dep).map(|t| t.status) {
                Some(TaskStatus::Finished) => {}
                Some(status) if status.is_terminal() => return Readiness::Blocked(dep.clone()),
                Some(_) => waiting = true,
                None => return Readiness::Blocked(dep.clone()),
            }
        }
        if waiting {
            Readiness::Waiting
        } else {
            Readiness::Ready
        }
    }

    fn expect(task: &Task, allowed: &[TaskStatus], event: &str) -> Result<(), SchedulerError> {
        if allowed.contains(&task.status) {
            Ok(())
        } else {
            Err(SchedulerError::InvalidTransition {
                task: task.id.to_string(),
                from: task.status.to_string(),
                event: event.to_string(),
            })
        }
    }
}
