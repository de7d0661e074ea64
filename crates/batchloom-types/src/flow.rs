//! Flow directives and the graph deltas they produce.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::{JobId, TaskId};
use crate::task::Task;

/// Post-execution instruction attached to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowAction {
    /// No graph change.
    Continue,
    /// Run the body from `target` (by name, an ancestor of the finished task
    /// or the task itself) through the finished task once more.
    Loop {
        target: String,
        /// Optional cron expression delaying the next iteration's entry task.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cron: Option<String>,
    },
    /// Run each block that starts right after the finished task `runs` times
    /// in parallel.
    Replicate { runs: u32 },
}

impl fmt::Display for FlowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::Loop { target, .. } => write!(f, "loop({target})"),
            Self::Replicate { runs } => write!(f, "replicate({runs})"),
        }
    }
}

/// Directed edge: `dependent` waits for `dependency`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub dependency: TaskId,
    pub dependent: TaskId,
}

/// Replace the dependency `from` of `dependent` by `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRewrite {
    pub dependent: TaskId,
    pub from: TaskId,
    pub to: TaskId,
}

/// Explicit description of one graph mutation produced by the flow resolver.
///
/// Applying a delta is idempotent: tasks already present are skipped, edges
/// already present are not duplicated, and a rewrite whose `from` edge is
/// gone is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDelta {
    pub job: JobId,
    /// The finished task whose directive produced this delta.
    pub origin: TaskId,
    pub action: FlowAction,
    #[serde(default)]
    pub added_tasks: Vec<Task>,
    #[serde(default)]
    pub added_edges: Vec<Edge>,
    #[serde(default)]
    pub rewired_edges: Vec<EdgeRewrite>,
}

impl GraphDelta {
    pub fn empty(origin: TaskId, action: FlowAction) -> Self {
        Self {
            job: origin.job.clone(),
            origin,
            action,
            added_tasks: Vec::new(),
            added_edges: Vec::new(),
            rewired_edges: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added_tasks.is_empty() && self.added_edges.is_empty() && self.rewired_edges.is_empty()
    }

    /// Existing tasks whose dependency list this delta changes.
    pub fn modified_tasks(&self) -> Vec<&TaskId> {
        let mut ids: Vec<&TaskId> = self
            .added_edges
            .iter()
            .map(|e| &e.dependent)
            .chain(self.rewired_edges.iter().map(|r| &r.dependent))
            .filter(|id| !self.added_tasks.iter().any(|t| &t.id == *id))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_action_serde_is_tagged() {
        let action = FlowAction::Loop {
            target: "fetch".into(),
            cron: None,
        };
        let json = serde_json::to_string(&action).unwrap();
        assert_eq!(json, r#"{"type":"loop","target":"fetch"}"#);

        let replicate: FlowAction = serde_json::from_str(r#"{"type":"replicate","runs":4}"#).unwrap();
        assert_eq!(replicate, FlowAction::Replicate { runs: 4 });
    }

    #[test]
    fn empty_delta_reports_empty() {
        let origin = TaskId::new(JobId::new(1, "j"), 1, "a");
        let delta = GraphDelta::empty(origin, FlowAction::Continue);
        assert!(delta.is_empty());
        assert!(delta.modified_tasks().is_empty());
    }
}
