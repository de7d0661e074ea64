//! Task records, lifecycle status and results.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::executable::{ExecutableContainer, ResourceRequirements, TaskOutput};
use crate::flow::FlowAction;
use crate::ids::TaskId;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Submitted,
    Pending,
    Running,
    Finished,
    Faulty,
    Failed,
    Aborted,
}

impl TaskStatus {
    /// Terminal statuses never change again.
    ///
    /// `Faulty` is only ever stored once the retry budget is spent; an attempt
    /// failure with retries left goes straight back to `Pending`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Faulty | Self::Failed | Self::Aborted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Faulty => "faulty",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(Self::Submitted),
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            "faulty" => Ok(Self::Faulty),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            other => Err(format!("invalid task status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Why a task attempt (or the task as a whole) did not finish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum FailureCause {
    /// The executable reported an error or exited non-zero.
    Application { message: String },
    /// The supervisor stopped the attempt at its deadline.
    Timeout { after_ms: u64 },
    /// No execution capacity could be acquired.
    ResourceUnavailable { message: String },
    /// A dependency ended without finishing.
    DependencyFailed { dependency: String },
    /// Cancelled from outside (job killed or cancelled on error).
    Aborted { reason: String },
    /// The job failed as a whole before this task could run.
    JobFailed { message: String },
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Application { message } => write!(f, "application error: {message}"),
            Self::Timeout { after_ms } => write!(f, "exceeded deadline of {after_ms}ms"),
            Self::ResourceUnavailable { message } => write!(f, "resource unavailable: {message}"),
            Self::DependencyFailed { dependency } => write!(f, "dependency {dependency} did not finish"),
            Self::Aborted { reason } => write!(f, "aborted: {reason}"),
            Self::JobFailed { message } => write!(f, "job failed: {message}"),
        }
    }
}

/// Write-once outcome of a terminal task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskResult {
    Success { output: TaskOutput },
    Failure { cause: FailureCause },
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

fn default_max_executions() -> u32 {
    1
}

/// One schedulable unit of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Ordered, duplicate-free list of tasks this one waits for.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    pub executable: ExecutableContainer,
    /// Declared flow directive, evaluated once the task finishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<FlowAction>,
    /// Name of the task closing the block this task opens, for REPLICATE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_end: Option<String>,
    #[serde(default = "default_max_executions")]
    pub max_executions_on_failure: u32,
    #[serde(default)]
    pub cancel_job_on_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub requirements: ResourceRequirements,
    pub status: TaskStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    /// Earliest instant the task may start (restart delay or cron loop).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<FailureCause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// A freshly submitted task with no dependencies.
    pub fn new(id: TaskId, executable: ExecutableContainer) -> Self {
        Self {
            id,
            dependencies: Vec::new(),
            executable,
            flow: None,
            block_end: None,
            max_executions_on_failure: default_max_executions(),
            cancel_job_on_error: false,
            timeout_ms: None,
            requirements: ResourceRequirements::default(),
            status: TaskStatus::Submitted,
            attempts: 0,
            result: None,
            not_before: None,
            last_failure: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn depends_on(&self, id: &TaskId) -> bool {
        self.dependencies.contains(id)
    }

    /// Add a dependency unless it is already present.
    pub fn add_dependency(&mut self, id: TaskId) {
        if !self.depends_on(&id) {
            self.dependencies.push(id);
        }
    }

    /// A new, never-run copy of this task under `id` with the given dependencies.
    ///
    /// Static properties are kept; runtime state is reset.
    pub fn duplicate(&self, id: TaskId, dependencies: Vec<TaskId>) -> Self {
        Self {
            id,
            dependencies,
            status: TaskStatus::Submitted,
            attempts: 0,
            result: None,
            not_before: None,
            last_failure: None,
            started_at: None,
            finished_at: None,
            ..self.clone()
        }
    }
}
