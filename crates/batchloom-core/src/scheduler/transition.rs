//! Committing a batch of task transitions.
//!
//! Every change to a job goes through [`Shared::commit`]: the records are
//! persisted in one read-write unit of work, then swapped into the live job,
//! then announced on the event bus. A failed commit leaves the live job and
//! the bus untouched.

use std::collections::HashMap;
use std::sync::Arc;

use batchloom_types::error::SchedulerError;
use batchloom_types::event::SchedulerEvent;
use batchloom_types::flow::FlowAction;
use batchloom_types::ids::TaskId;
use batchloom_types::job::{Job, JobStatus};
use batchloom_types::task::{Task, TaskStatus};
use chrono::{DateTime, Utc};

use super::Shared;
use super::live::LiveJob;
use crate::execution::{ResourceAllocator, WorkerDispatch};
use crate::flow::apply_records;
use crate::repository::{JobSession, TransactionalBackend};

/// Graph growth caused by a flow directive.
#[derive(Debug, Clone)]
pub(crate) struct Expansion {
    pub origin: TaskId,
    pub action: FlowAction,
    pub added: Vec<TaskId>,
}

/// Records to commit together.
#[derive(Debug, Default)]
pub(crate) struct Transition {
    pub tasks: Vec<Task>,
    /// Explicit terminal job status. Otherwise the status follows the tasks.
    pub end: Option<JobStatus>,
    pub error: Option<String>,
    pub expansion: Option<Expansion>,
}

impl Transition {
    pub fn tasks(tasks: Vec<Task>) -> Self {
        Self {
            tasks,
            ..Self::default()
        }
    }

    pub fn ending(tasks: Vec<Task>, status: JobStatus, error: Option<String>) -> Self {
        Self {
            tasks,
            end: Some(status),
            error,
            expansion: None,
        }
    }
}

impl<B, A, D> Shared<B, A, D>
where
    B: TransactionalBackend,
    A: ResourceAllocator,
    D: WorkerDispatch,
{
    /// Persist `batch`, apply it to `live`, then publish its events.
    pub(crate) async fn commit(
        &self,
        live: &LiveJob,
        batch: Transition,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let (header, events) = {
            let job = live.job.read().await;
            plan(&job, &batch, now)
        };

        let tasks = Arc::new(batch.tasks);
        let staged = Arc::clone(&tasks);
        let saved = header.clone();
        self.runner
            .run_read_write(move |session| {
                let tasks = Arc::clone(&staged);
                let header = saved.clone();
                Box::pin(async move {
                    if let Some(header) = &header {
                        session.save_job(header).await?;
                    }
                    session.upsert_tasks(&tasks).await
                })
            })
            .await?;

        let tasks = Arc::try_unwrap(tasks).unwrap_or_else(|shared| shared.as_ref().clone());
        {
            let mut job = live.job.write().await;
            apply_records(&mut job, tasks);
            if let Some(header) = header {
                job.status = header.status;
                job.error = header.error;
                job.finished_at = header.finished_at;
            }
        }

        self.events.publish_all(events);
        Ok(())
    }
}

/// Job header to save (if it changes) and the events `batch` produces.
fn plan(job: &Job, batch: &Transition, now: DateTime<Utc>) -> (Option<Job>, Vec<SchedulerEvent>) {
    let mut events = Vec::new();
    for task in &batch.tasks {
        let before = job.task(&task.id).map(|t| t.status);
        if before != Some(task.status) {
            events.push(SchedulerEvent::TaskStatusChanged {
                task_id: task.id.clone(),
                status: task.status,
                attempt: task.attempts,
                at: now,
            });
        }
    }
    if let Some(expansion) = &batch.expansion {
        events.push(SchedulerEvent::GraphExpanded {
            job_id: job.id.clone(),
            origin: expansion.origin.clone(),
            action: expansion.action.clone(),
            added: expansion.added.clone(),
            at: now,
        });
    }

    let status = match batch.end {
        Some(status) if !job.is_terminal() => status,
        _ => status_after(job, &batch.tasks),
    };
    let error_changed = batch.error.is_some() && batch.error != job.error;
    if status == job.status && !error_changed {
        return (None, events);
    }

    let mut header = job.header();
    if status != job.status {
        header.status = status;
        if status.is_terminal() {
            header.finished_at = Some(now);
        }
        events.push(SchedulerEvent::JobStatusChanged {
            job_id: job.id.clone(),
            status,
            at: now,
        });
    }
    if error_changed {
        header.error = batch.error.clone();
    }
    (Some(header), events)
}

/// Status the job will have once `changes` are applied.
fn status_after(job: &Job, changes: &[Task]) -> JobStatus {
    if job.is_terminal() {
        return job.status;
    }
    let changed: HashMap<&TaskId, &Task> = changes.iter().map(|t| (&t.id, t)).collect();
    let merged = job
        .tasks()
        .map(|t| changed.get(&t.id).copied().unwrap_or(t))
        .chain(changes.iter().filter(|t| !job.contains(&t.id)));

    let mut all_terminal = true;
    let mut started = false;
    for task in merged {
        all_terminal &= task.is_terminal();
        started |= task.attempts > 0 || task.is_terminal() || task.status == TaskStatus::Running;
    }

    if all_terminal {
        JobStatus::Finished
    } else if started {
        JobStatus::Running
    } else {
        JobStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchloom_types::executable::{ExecutableContainer, ExecutableDescription};
    use batchloom_types::ids::JobId;

    fn job(names: &[&str]) -> Job {
        let id = JobId::new(1, "j");
        let mut job = Job::new(id.clone(), "tester", Utc::now());
        for (i, name) in names.iter().enumerate() {
            job.put_task(Task::new(
                TaskId::new(id.clone(), i as u32 + 1, *name),
                ExecutableContainer::new(ExecutableDescription {
                    kind: "noop".into(),
                    spec: serde_json::Value::Null,
                }),
            ));
        }
        job
    }

    fn with_status(job: &Job, id: u32, status: TaskStatus) -> Task {
        let mut task = job
            .tasks()
            .find(|t| t.id.id == id)
            .cloned()
            .unwrap();
        task.status = status;
        task
    }

    #[test]
    fn unchanged_status_emits_no_event() {
        let j = job(&["a", "b"]);
        let batch = Transition::tasks(vec![with_status(&j, 1, TaskStatus::Submitted)]);
        let (header, events) = plan(&j, &batch, Utc::now());
        assert!(header.is_none());
        assert!(events.is_empty());
    }

    #[test]
    fn first_start_moves_job_to_running() {
        let j = job(&["a", "b"]);
        let mut running = with_status(&j, 1, TaskStatus::Running);
        running.attempts = 1;
        let (header, events) = plan(&j, &Transition::tasks(vec![running]), Utc::now());

        assert_eq!(header.unwrap().status, JobStatus::Running);
        assert!(matches!(
            events.as_slice(),
            [
                SchedulerEvent::TaskStatusChanged {
                    status: TaskStatus::Running,
                    attempt: 1,
                    ..
                },
                SchedulerEvent::JobStatusChanged {
                    status: JobStatus::Running,
                    ..
                }
            ]
        ));
    }

    #[test]
    fn last_terminal_task_finishes_job() {
        let mut j = job(&["a", "b"]);
        j.put_task(with_status(&j, 1, TaskStatus::Finished));
        j.status = JobStatus::Running;
        let done = with_status(&j, 2, TaskStatus::Faulty);
        let now = Utc::now();
        let (header, _) = plan(&j, &Transition::tasks(vec![done]), now);
        let header = header.unwrap();
        assert_eq!(header.status, JobStatus::Finished);
        assert_eq!(header.finished_at, Some(now));
    }

    #[test]
    fn added_tasks_keep_job_open() {
        let mut j = job(&["a"]);
        j.status = JobStatus::Running;
        let finished = with_status(&j, 1, TaskStatus::Finished);
        let mut copy = finished.duplicate(finished.id.with_iteration(1), vec![finished.id.clone()]);
        copy.status = TaskStatus::Submitted;
        assert_eq!(status_after(&j, &[finished, copy]), JobStatus::Running);
    }

    #[test]
    fn explicit_end_carries_error() {
        let j = job(&["a"]);
        let batch = Transition::ending(vec![], JobStatus::Failed, Some("bad loop".into()));
        let (header, events) = plan(&j, &batch, Utc::now());
        let header = header.unwrap();
        assert_eq!(header.status, JobStatus::Failed);
        assert_eq!(header.error.as_deref(), Some("bad loop"));
        assert_eq!(events.len(), 1);
    }
}
