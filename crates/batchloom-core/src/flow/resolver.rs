//! Flow directive resolution.
//!
//! Turns the directive of a finished task into a [`GraphDelta`]. Resolution
//! is pure: it reads the job graph and never mutates it. The delta is applied
//! later through [`super::apply`], after it has been committed.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use batchloom_types::error::SchedulerError;
use batchloom_types::flow::{Edge, EdgeRewrite, FlowAction, GraphDelta};
use batchloom_types::ids::TaskId;
use batchloom_types::job::Job;
use batchloom_types::task::{Task, TaskResult};
use chrono::{DateTime, Utc};

use crate::graph::{GraphIndex, parse_cron};

/// Stateless resolver for LOOP and REPLICATE directives.
pub struct FlowResolver;

impl FlowResolver {
    /// The directive that applies to a finished task.
    ///
    /// A flow decision returned by the executable overrides the declared one;
    /// without either the task continues.
    pub fn effective_action(task: &Task) -> FlowAction {
        let runtime = match &task.result {
            Some(TaskResult::Success { output }) => output.flow.clone(),
            _ => None,
        };
        runtime
            .or_else(|| task.flow.clone())
            .unwrap_or(FlowAction::Continue)
    }

    /// Compute the graph delta produced by `finished`'s directive.
    ///
    /// `finished` is the task as it will be committed (status FINISHED, result
    /// set); `job` supplies the surrounding graph. Unknown loop targets or
    /// block ends fail with [`SchedulerError::MalformedWorkflow`].
    pub fn evaluate_flow_action(
        job: &Job,
        finished: &Task,
        now: DateTime<Utc>,
    ) -> Result<GraphDelta, SchedulerError> {
        let action = Self::effective_action(finished);
        let index = GraphIndex::new(job);
        match &action {
            FlowAction::Continue => Ok(GraphDelta::empty(finished.id.clone(), action)),
            FlowAction::Loop { target, cron } => {
                resolve_loop(&index, finished, target, cron.as_deref(), now, action.clone())
            }
            FlowAction::Replicate { runs } => {
                resolve_replicate(&index, finished, *runs, action.clone())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// LOOP
// ---------------------------------------------------------------------------

fn resolve_loop(
    index: &GraphIndex<'_>,
    finished: &Task,
    target_name: &str,
    cron: Option<&str>,
    now: DateTime<Utc>,
    action: FlowAction,
) -> Result<GraphDelta, SchedulerError> {
    let job = index.job();
    let target = index.find_up(&finished.id, target_name).ok_or_else(|| {
        SchedulerError::MalformedWorkflow(format!(
            "loop target '{}' of task {} is not the task or one of its ancestors",
            target_name, finished.id
        ))
    })?;

    let path = index.path_between(&target.id, &finished.id);
    let body = lowest_replicas(&path, &target.id, &finished.id);
    let next_start = match cron {
        Some(expr) => Some(next_occurrence(expr, now)?),
        None => None,
    };

    let mapping: BTreeMap<TaskId, TaskId> = body
        .iter()
        .map(|id| {
            let iteration = index.max_iteration(id.id, id.replication) + 1;
            (id.clone(), id.with_iteration(iteration))
        })
        .collect();

    let mut delta = GraphDelta::empty(finished.id.clone(), action);
    for id in &body {
        let Some(original) = job.task(id) else { continue };
        let dependencies = if *id == target.id {
            vec![finished.id.clone()]
        } else {
            original
                .dependencies
                .iter()
                .filter(|d| body.contains(*d) || !path.contains(*d))
                .map(|d| mapping.get(d).cloned().unwrap_or_else(|| d.clone()))
                .collect()
        };
        let mut copy = original.duplicate(mapping[id].clone(), dependencies);
        if *id == target.id {
            copy.not_before = next_start;
        }
        delta.added_tasks.push(copy);
    }

    let tail = mapping[&finished.id].clone();
    for dependent in index.dependents(&finished.id) {
        if path.contains(dependent) || mapping.values().any(|m| m == dependent) {
            continue;
        }
        let terminal = job.task(dependent).is_some_and(Task::is_terminal);
        if terminal {
            continue;
        }
        delta.rewired_edges.push(EdgeRewrite {
            dependent: dependent.clone(),
            from: finished.id.clone(),
            to: tail.clone(),
        });
    }

    tracing::debug!(
        origin = %finished.id,
        target = %target.id,
        added = delta.added_tasks.len(),
        rewired = delta.rewired_edges.len(),
        "resolved loop"
    );
    Ok(delta)
}

/// One instance per task and iteration, the lowest replica. The copied body
/// fans out again when its REPLICATE directive runs, so replicas are left
/// behind together with the edges into them.
fn lowest_replicas(path: &BTreeSet<TaskId>, target: &TaskId, finished: &TaskId) -> BTreeSet<TaskId> {
    let mut lowest: BTreeMap<(u32, u32), &TaskId> = BTreeMap::new();
    for id in path {
        lowest
            .entry((id.id, id.iteration))
            .and_modify(|kept| {
                if id.replication < kept.replication {
                    *kept = id;
                }
            })
            .or_insert(id);
    }
    let mut body: BTreeSet<TaskId> = lowest.into_values().cloned().collect();
    body.insert(target.clone());
    body.insert(finished.clone());
    body
}

fn next_occurrence(expr: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, SchedulerError> {
    let cron = parse_cron(expr)?;
    cron.iter_after(now).next().ok_or_else(|| {
        SchedulerError::MalformedWorkflow(format!("cron expression '{expr}' has no future occurrence"))
    })
}

// ---------------------------------------------------------------------------
// REPLICATE
// ---------------------------------------------------------------------------

fn resolve_replicate(
    index: &GraphIndex<'_>,
    finished: &Task,
    runs: u32,
    action: FlowAction,
) -> Result<GraphDelta, SchedulerError> {
    let job = index.job();
    let runs = runs.max(1);
    let mut delta = GraphDelta::empty(finished.id.clone(), action);
    if runs == 1 {
        return Ok(delta);
    }

    // Next free replication index per (numeric id, iteration).
    let mut next_replication: HashMap<(u32, u32), u32> = HashMap::new();

    for start_id in index.dependents(&finished.id) {
        let Some(start) = job.task(start_id) else { continue };
        if start.is_terminal() {
            continue;
        }

        let (body, end) = match &start.block_end {
            Some(end_name) => {
                let end = index.find_down(start_id, end_name).ok_or_else(|| {
                    SchedulerError::MalformedWorkflow(format!(
                        "no block end '{}' below replicated task {}",
                        end_name, start_id
                    ))
                })?;
                (index.path_between(start_id, &end.id), end.id.clone())
            }
            None => (BTreeSet::from([start_id.clone()]), start_id.clone()),
        };

        let merges: Vec<TaskId> = index
            .dependents(&end)
            .into_iter()
            .filter(|id| !body.contains(*id))
            .cloned()
            .collect();

        for _ in 1..runs {
            let mapping: BTreeMap<TaskId, TaskId> = body
                .iter()
                .map(|id| {
                    let slot = next_replication
                        .entry((id.id, id.iteration))
                        .or_insert_with(|| index.max_replication(id.id, id.iteration) + 1);
                    let copy = id.with_replication(*slot);
                    *slot += 1;
                    (id.clone(), copy)
                })
                .collect();

            for id in &body {
                let Some(original) = job.task(id) else { continue };
                let dependencies = remap(&original.dependencies, &mapping);
                delta
                    .added_tasks
                    .push(original.duplicate(mapping[id].clone(), dependencies));
            }
            for merge in &merges {
                delta.added_edges.push(Edge {
                    dependency: mapping[&end].clone(),
                    dependent: merge.clone(),
                });
            }
        }
    }

    tracing::debug!(
        origin = %finished.id,
        runs,
        added = delta.added_tasks.len(),
        merge_edges = delta.added_edges.len(),
        "resolved replicate"
    );
    Ok(delta)
}

/// Map dependencies inside the duplicated body to their copies; keep the rest.
fn remap(dependencies: &[TaskId], mapping: &BTreeMap<TaskId, TaskId>) -> Vec<TaskId> {
    dependencies
        .iter()
        .map(|d| mapping.get(d).cloned().unwrap_or_else(|| d.clone()))
        .collect()
}
