//! Job records and the static graph accepted at submission.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::executable::{Credentials, ExecutableDescription};
use crate::flow::FlowAction;
use crate::ids::{JobId, TaskId};
use crate::task::{Task, TaskStatus};

/// Aggregate status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// No task has started yet.
    Pending,
    Running,
    /// Every task is terminal.
    Finished,
    /// Cancelled because a task with `cancel_job_on_error` ended faulty.
    Canceled,
    /// Aborted on request.
    Killed,
    /// Malformed workflow or unrecoverable storage failure.
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Canceled | Self::Killed | Self::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Canceled => "canceled",
            Self::Killed => "killed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            "canceled" => Ok(Self::Canceled),
            "killed" => Ok(Self::Killed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("invalid job status: '{other}'")),
        }
    }
}

/// A job and all its task instances, including those added at runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub owner: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    tasks: BTreeMap<TaskId, Task>,
}

impl Job {
    pub fn new(id: JobId, owner: impl Into<String>, submitted_at: DateTime<Utc>) -> Self {
        Self {
            id,
            owner: owner.into(),
            status: JobStatus::Pending,
            error: None,
            submitted_at,
            finished_at: None,
            tasks: BTreeMap::new(),
        }
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    /// Tasks in id order (numeric id, then iteration, then replication).
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Insert or replace a task record.
    pub fn put_task(&mut self, task: Task) {
        self.tasks.insert(task.id.clone(), task);
    }

    pub fn all_tasks_terminal(&self) -> bool {
        self.tasks.values().all(Task::is_terminal)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Status implied by the tasks, for a job that has not been ended explicitly.
    pub fn derived_status(&self) -> JobStatus {
        if self.status.is_terminal() {
            return self.status;
        }
        if self.all_tasks_terminal() {
            return JobStatus::Finished;
        }
        let started = self
            .tasks
            .values()
            .any(|t| t.attempts > 0 || t.status == TaskStatus::Running || t.is_terminal());
        if started {
            JobStatus::Running
        } else {
            JobStatus::Pending
        }
    }

    /// Copy of the job record without its tasks.
    pub fn header(&self) -> Job {
        Job {
            id: self.id.clone(),
            owner: self.owner.clone(),
            status: self.status,
            error: self.error.clone(),
            submitted_at: self.submitted_at,
            finished_at: self.finished_at,
            tasks: BTreeMap::new(),
        }
    }

    /// Header fields and task count, without the task map.
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id.clone(),
            owner: self.owner.clone(),
            status: self.status,
            error: self.error.clone(),
            submitted_at: self.submitted_at,
            finished_at: self.finished_at,
            task_count: self.tasks.len(),
        }
    }

    /// Count of tasks per status, for summaries.
    pub fn status_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for task in self.tasks.values() {
            *counts.entry(task.status.as_str()).or_insert(0) += 1;
        }
        counts
    }
}

/// Listing view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub owner: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub task_count: usize,
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

fn default_max_executions() -> u32 {
    1
}

fn default_nodes() -> u32 {
    1
}

/// Static description of one task, referencing other tasks by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub executable: ExecutableDescription,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub run_as_user: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<FlowAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_end: Option<String>,
    #[serde(default = "default_max_executions")]
    pub max_executions_on_failure: u32,
    #[serde(default)]
    pub cancel_job_on_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_nodes")]
    pub nodes: u32,
}

/// Static job graph handed to `submit_job`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSubmission {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub tasks: Vec<TaskSubmission>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executable::ExecutableContainer;

    fn job_with(statuses: &[TaskStatus]) -> Job {
        let id = JobId::new(1, "job");
        let mut job = Job::new(id.clone(), "tester", Utc::now());
        for (i, status) in statuses.iter().enumerate() {
            let mut task = Task::new(
                TaskId::new(id.clone(), i as u32 + 1, format!("t{i}")),
                ExecutableContainer::new(ExecutableDescription {
                    kind: "noop".into(),
                    spec: serde_json::Value::Null,
                }),
            );
            task.status = *status;
            job.put_task(task);
        }
        job
    }

    #[test]
    fn derived_status_follows_tasks() {
        assert_eq!(
            job_with(&[TaskStatus::Pending, TaskStatus::Submitted]).derived_status(),
            JobStatus::Pending
        );
        assert_eq!(
            job_with(&[TaskStatus::Running, TaskStatus::Pending]).derived_status(),
            JobStatus::Running
        );
        assert_eq!(
            job_with(&[TaskStatus::Finished, TaskStatus::Faulty]).derived_status(),
            JobStatus::Finished
        );
    }

    #[test]
    fn explicit_terminal_status_wins() {
        let mut job = job_with(&[TaskStatus::Pending]);
        job.status = JobStatus::Killed;
        assert_eq!(job.derived_status(), JobStatus::Killed);
    }

    #[test]
    fn submission_defaults() {
        let json = r#"{
            "name": "etl",
            "tasks": [
                {"name": "extract", "executable": {"kind": "command", "spec": {"program": "true"}}}
            ]
        }"#;
        let submission: JobSubmission = serde_json::from_str(json).unwrap();
        let task = &submission.tasks[0];
        assert_eq!(task.max_executions_on_failure, 1);
        assert_eq!(task.nodes, 1);
        assert!(task.depends_on.is_empty());
        assert!(submission.owner.is_none());
    }

    #[test]
    fn job_status_parse() {
        assert_eq!("killed".parse::<JobStatus>().unwrap(), JobStatus::Killed);
        assert!("done".parse::<JobStatus>().is_err());
    }
}
