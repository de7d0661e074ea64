//! Applying graph deltas.
//!
//! [`materialize`] computes the task records a delta produces; the scheduler
//! persists exactly those records and then hands them to the in-memory job.
//! Both steps are idempotent, so replaying a delta after a crash is harmless.

use std::collections::BTreeMap;

use batchloom_types::flow::GraphDelta;
use batchloom_types::ids::TaskId;
use batchloom_types::job::Job;
use batchloom_types::task::Task;

/// Task records (new or with changed dependencies) resulting from `delta`.
///
/// Tasks already present in `job` are never overwritten, edges already
/// present are not duplicated, and a rewrite whose source edge is gone is
/// skipped. Records are returned in id order.
pub fn materialize(job: &Job, delta: &GraphDelta) -> Vec<Task> {
    let mut staged: BTreeMap<TaskId, Task> = BTreeMap::new();

    for task in &delta.added_tasks {
        if !job.contains(&task.id) {
            staged.insert(task.id.clone(), task.clone());
        }
    }

    for edge in &delta.added_edges {
        let Some(task) = stage(job, &mut staged, &edge.dependent, |t| {
            !t.depends_on(&edge.dependency)
        }) else {
            continue;
        };
        task.add_dependency(edge.dependency.clone());
    }

    for rewrite in &delta.rewired_edges {
        let Some(task) = stage(job, &mut staged, &rewrite.dependent, |t| {
            t.depends_on(&rewrite.from)
        }) else {
            continue;
        };
        if task.depends_on(&rewrite.to) {
            task.dependencies.retain(|d| d != &rewrite.from);
        } else if let Some(slot) = task.dependencies.iter_mut().find(|d| **d == rewrite.from) {
            *slot = rewrite.to.clone();
        }
    }

    staged.into_values().collect()
}

/// Borrow the staged copy of `id`, staging it from `job` when `needs_change` holds.
fn stage<'s, F>(
    job: &Job,
    staged: &'s mut BTreeMap<TaskId, Task>,
    id: &TaskId,
    needs_change: F,
) -> Option<&'s mut Task>
where
    F: Fn(&Task) -> bool,
{
    if let Some(existing) = staged.get(id) {
        if !needs_change(existing) {
            return None;
        }
    } else {
        let task = job.task(id)?;
        if !needs_change(task) {
            return None;
        }
        staged.insert(id.clone(), task.clone());
    }
    staged.get_mut(id)
}

/// Apply `delta` to the in-memory job and return the ids of the touched tasks.
pub fn apply_delta(job: &mut Job, delta: &GraphDelta) -> Vec<TaskId> {
    let records = materialize(job, delta);
    apply_records(job, records)
}

/// Put already materialized records into the job.
pub fn apply_records(job: &mut Job, records: Vec<Task>) -> Vec<TaskId> {
    let touched = records.iter().map(|t| t.id.clone()).collect();
    for record in records {
        job.put_task(record);
    }
    debug_assert!(crate::graph::is_acyclic(job), "graph delta introduced a cycle");
    touched
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchloom_types::executable::{ExecutableContainer, ExecutableDescription};
    use batchloom_types::flow::{Edge, EdgeRewrite, FlowAction};
    use batchloom_types::ids::JobId;
    use chrono::Utc;

    fn task(id: u32, name: &str, deps: Vec<TaskId>) -> Task {
        let mut task = Task::new(
            TaskId::new(JobId::new(1, "j"), id, name),
            ExecutableContainer::new(ExecutableDescription {
                kind: "noop".into(),
                spec: serde_json::Value::Null,
            }),
        );
        task.dependencies = deps;
        task
    }

    fn base() -> (Job, Task, Task) {
        let mut job = Job::new(JobId::new(1, "j"), "tester", Utc::now());
        let a = task(1, "a", vec![]);
        let b = task(2, "b", vec![a.id.clone()]);
        job.put_task(a.clone());
        job.put_task(b.clone());
        (job, a, b)
    }

    fn loop_delta(a: &Task, b: &Task) -> GraphDelta {
        let copy = a.duplicate(a.id.with_iteration(1), vec![a.id.clone()]);
        GraphDelta {
            added_tasks: vec![copy.clone()],
            rewired_edges: vec![EdgeRewrite {
                dependent: b.id.clone(),
                from: a.id.clone(),
                to: copy.id.clone(),
            }],
            ..GraphDelta::empty(
                a.id.clone(),
                FlowAction::Loop {
                    target: "a".into(),
                    cron: None,
                },
            )
        }
    }

    #[test]
    fn rewrite_replaces_edge_in_place() {
        let (mut job, a, b) = base();
        let delta = loop_delta(&a, &b);
        let touched = apply_delta(&mut job, &delta);
        assert_eq!(touched.len(), 2);
        assert_eq!(job.task(&b.id).unwrap().dependencies, vec![a.id.with_iteration(1)]);
        assert_eq!(job.task_count(), 3);
    }

    #[test]
    fn replaying_a_committed_delta_changes_nothing() {
        let (mut job, a, b) = base();
        let delta = loop_delta(&a, &b);
        apply_delta(&mut job, &delta);
        let before = job.clone();

        assert!(materialize(&job, &delta).is_empty());
        let touched = apply_delta(&mut job, &delta);
        assert!(touched.is_empty());
        assert_eq!(job, before);
        assert_eq!(job.task_count(), 3);
    }

    #[test]
    fn added_edges_are_not_duplicated() {
        let (mut job, a, b) = base();
        let extra = task(3, "c", vec![]);
        job.put_task(extra.clone());
        let delta = GraphDelta {
            added_edges: vec![
                Edge {
                    dependency: extra.id.clone(),
                    dependent: b.id.clone(),
                },
                Edge {
                    dependency: extra.id.clone(),
                    dependent: b.id.clone(),
                },
            ],
            ..GraphDelta::empty(a.id.clone(), FlowAction::Replicate { runs: 2 })
        };
        apply_delta(&mut job, &delta);
        assert_eq!(job.task(&b.id).unwrap().dependencies, vec![a.id.clone(), extra.id.clone()]);
        apply_delta(&mut job, &delta);
        assert_eq!(job.task(&b.id).unwrap().dependencies.len(), 2);
    }

    #[test]
    fn existing_task_is_never_overwritten() {
        let (mut job, a, b) = base();
        let mut running = job.task(&b.id).unwrap().clone();
        running.attempts = 4;
        job.put_task(running);

        let delta = GraphDelta {
            added_tasks: vec![b.clone()],
            ..GraphDelta::empty(a.id.clone(), FlowAction::Continue)
        };
        apply_delta(&mut job, &delta);
        assert_eq!(job.task(&b.id).unwrap().attempts, 4);
    }
}
