//! Status-change events published by the scheduler.
//!
//! Events are emitted only after the corresponding transition has been
//! committed to storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::flow::FlowAction;
use crate::ids::{JobId, TaskId};
use crate::job::JobStatus;
use crate::task::TaskStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    TaskStatusChanged {
        task_id: TaskId,
        status: TaskStatus,
        attempt: u32,
        at: DateTime<Utc>,
    },
    JobStatusChanged {
        job_id: JobId,
        status: JobStatus,
        at: DateTime<Utc>,
    },
    /// A flow directive grew the graph.
    GraphExpanded {
        job_id: JobId,
        origin: TaskId,
        action: FlowAction,
        added: Vec<TaskId>,
        at: DateTime<Utc>,
    },
}

impl SchedulerEvent {
    /// Numeric id of the job the event belongs to.
    pub fn job(&self) -> u64 {
        match self {
            Self::TaskStatusChanged { task_id, .. } => task_id.job.id,
            Self::JobStatusChanged { job_id, .. } | Self::GraphExpanded { job_id, .. } => job_id.id,
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Self::TaskStatusChanged { at, .. }
            | Self::JobStatusChanged { at, .. }
            | Self::GraphExpanded { at, .. } => *at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_job_accessor() {
        let job = JobId::new(9, "j");
        let event = SchedulerEvent::TaskStatusChanged {
            task_id: TaskId::new(job.clone(), 1, "a"),
            status: TaskStatus::Running,
            attempt: 1,
            at: Utc::now(),
        };
        assert_eq!(event.job(), 9);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task_status_changed");
        assert_eq!(json["status"], "running");
    }
}
