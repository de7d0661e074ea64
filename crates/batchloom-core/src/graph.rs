//! Job graph seeding, validation and traversal.
//!
//! Submission validation uses `petgraph` the same way on every job: a
//! `DiGraph` with an edge from dependency to dependent, `toposort` for cycle
//! detection and `has_path_connecting` for flow-directive reachability.
//! Runtime traversal (used by the flow resolver) works directly on the
//! [`Job`] task map through a reverse-edge index.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use batchloom_types::error::SchedulerError;
use batchloom_types::executable::{ExecutableContainer, ResourceRequirements};
use batchloom_types::flow::FlowAction;
use batchloom_types::ids::{JobId, TaskId};
use batchloom_types::job::{Job, JobSubmission};
use batchloom_types::task::Task;
use chrono::{DateTime, Utc};
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};

// ---------------------------------------------------------------------------
// Seeding
// ---------------------------------------------------------------------------

/// Validate a static submission and turn it into a job with every task SUBMITTED.
///
/// Numeric task ids follow declaration order starting at 1. Any structural
/// problem is reported as [`SchedulerError::MalformedWorkflow`].
pub fn build_job(
    id: JobId,
    submission: &JobSubmission,
    submitted_at: DateTime<Utc>,
) -> Result<Job, SchedulerError> {
    validate_submission(submission)?;

    let owner = submission.owner.clone().unwrap_or_else(|| "anonymous".to_string());
    let mut job = Job::new(id.clone(), owner, submitted_at);

    let ids: HashMap<&str, TaskId> = submission
        .tasks
        .iter()
        .enumerate()
        .map(|(i, t)| {
            (
                t.name.as_str(),
                TaskId::new(id.clone(), i as u32 + 1, t.name.clone()),
            )
        })
        .collect();

    for spec in &submission.tasks {
        let mut container = ExecutableContainer::new(spec.executable.clone());
        container.credentials = spec.credentials.clone();
        container.run_as_user = spec.run_as_user;

        let mut task = Task::new(ids[spec.name.as_str()].clone(), container);
        for dep in &spec.depends_on {
            task.add_dependency(ids[dep.as_str()].clone());
        }
        task.flow = spec.flow.clone();
        task.block_end = spec.block_end.clone();
        task.max_executions_on_failure = spec.max_executions_on_failure;
        task.cancel_job_on_error = spec.cancel_job_on_error;
        task.timeout_ms = spec.timeout_ms;
        task.requirements = ResourceRequirements { nodes: spec.nodes };
        job.put_task(task);
    }

    Ok(job)
}

/// Structural checks on a static submission.
pub fn validate_submission(submission: &JobSubmission) -> Result<(), SchedulerError> {
    let malformed = |msg: String| SchedulerError::MalformedWorkflow(msg);

    if submission.tasks.is_empty() {
        return Err(malformed(format!("job '{}' has no tasks", submission.name)));
    }

    let mut graph = DiGraph::<&str, ()>::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    for task in &submission.tasks {
        if task.name.is_empty() {
            return Err(malformed("task with empty name".into()));
        }
        if index.contains_key(task.name.as_str()) {
            return Err(malformed(format!("duplicate task name '{}'", task.name)));
        }
        if task.max_executions_on_failure == 0 {
            return Err(malformed(format!(
                "task '{}': max_executions_on_failure must be at least 1",
                task.name
            )));
        }
        if task.nodes == 0 {
            return Err(malformed(format!("task '{}': nodes must be at least 1", task.name)));
        }
        index.insert(task.name.as_str(), graph.add_node(task.name.as_str()));
    }

    // Edge from dependency -> dependent
    for task in &submission.tasks {
        let to = index[task.name.as_str()];
        for dep in &task.depends_on {
            let from = index.get(dep.as_str()).ok_or_else(|| {
                malformed(format!("task '{}' depends on unknown task '{}'", task.name, dep))
            })?;
            graph.add_edge(*from, to, ());
        }
    }

    toposort(&graph, None).map_err(|cycle| {
        malformed(format!("cycle detected involving task '{}'", graph[cycle.node_id()]))
    })?;

    for task in &submission.tasks {
        let node = index[task.name.as_str()];
        if let Some(FlowAction::Loop { target, cron }) = &task.flow {
            let target_node = index.get(target.as_str()).ok_or_else(|| {
                malformed(format!("task '{}' loops to unknown task '{}'", task.name, target))
            })?;
            if !has_path_connecting(&graph, *target_node, node, None) {
                return Err(malformed(format!(
                    "loop target '{}' of task '{}' is not one of its ancestors",
                    target, task.name
                )));
            }
            if let Some(expr) = cron {
                parse_cron(expr)?;
            }
        }
        if let Some(end) = &task.block_end {
            let end_node = index.get(end.as_str()).ok_or_else(|| {
                malformed(format!("task '{}' closes its block with unknown task '{}'", task.name, end))
            })?;
            if !has_path_connecting(&graph, node, *end_node, None) {
                return Err(malformed(format!(
                    "block end '{}' is not reachable from task '{}'",
                    end, task.name
                )));
            }
        }
    }

    Ok(())
}

/// Parse a cron expression, mapping failures to a malformed workflow.
pub fn parse_cron(expr: &str) -> Result<croner::Cron, SchedulerError> {
    expr.parse::<croner::Cron>()
        .map_err(|e| SchedulerError::MalformedWorkflow(format!("invalid cron expression '{expr}': {e}")))
}

// ---------------------------------------------------------------------------
// Traversal
// ---------------------------------------------------------------------------

/// Read-only view of a job's graph with a reverse (dependents) index.
pub struct GraphIndex<'a> {
    job: &'a Job,
    dependents: HashMap<&'a TaskId, Vec<&'a TaskId>>,
}

impl<'a> GraphIndex<'a> {
    pub fn new(job: &'a Job) -> Self {
        let mut dependents: HashMap<&TaskId, Vec<&TaskId>> = HashMap::new();
        for task in job.tasks() {
            for dep in &task.dependencies {
                dependents.entry(dep).or_default().push(&task.id);
            }
        }
        Self { job, dependents }
    }

    pub fn job(&self) -> &'a Job {
        self.job
    }

    /// Direct dependents of `id`, in id order.
    pub fn dependents(&self, id: &TaskId) -> Vec<&'a TaskId> {
        let mut out = self.dependents.get(id).cloned().unwrap_or_default();
        out.sort();
        out
    }

    /// Every task `id` transitively depends on (excluding `id`).
    pub fn ancestors(&self, id: &TaskId) -> BTreeSet<TaskId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&TaskId> = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            let Some(task) = self.job.task(current) else { continue };
            for dep in &task.dependencies {
                if seen.insert(dep.clone()) {
                    queue.push_back(dep);
                }
            }
        }
        seen
    }

    /// Every task transitively depending on `id` (excluding `id`).
    pub fn descendants(&self, id: &TaskId) -> BTreeSet<TaskId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&TaskId> = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents.get(current).into_iter().flatten() {
                if seen.insert((*dependent).clone()) {
                    queue.push_back(*dependent);
                }
            }
        }
        seen
    }

    /// Tasks on any path from `from` to `to`, both included.
    ///
    /// Empty when `to` is not reachable from `from`.
    pub fn path_between(&self, from: &TaskId, to: &TaskId) -> BTreeSet<TaskId> {
        if from == to {
            return BTreeSet::from([from.clone()]);
        }
        let down = self.descendants(from);
        if !down.contains(to) {
            return BTreeSet::new();
        }
        let up = self.ancestors(to);
        let mut body: BTreeSet<TaskId> = down.intersection(&up).cloned().collect();
        body.insert(from.clone());
        body.insert(to.clone());
        body
    }

    /// Nearest task named `name` among `from` and its ancestors (breadth first).
    pub fn find_up(&self, from: &TaskId, name: &str) -> Option<&'a Task> {
        self.find(from, name, |task| task.dependencies.iter().collect())
    }

    /// Nearest task named `name` among `from` and its descendants (breadth first).
    pub fn find_down(&self, from: &TaskId, name: &str) -> Option<&'a Task> {
        self.find(from, name, |task| self.dependents(&task.id))
    }

    fn find<F>(&self, from: &TaskId, name: &str, next: F) -> Option<&'a Task>
    where
        F: Fn(&'a Task) -> Vec<&'a TaskId>,
    {
        let mut seen: HashSet<&TaskId> = HashSet::new();
        let mut queue: VecDeque<&'a Task> = self.job.task(from).into_iter().collect();
        while let Some(task) = queue.pop_front() {
            if task.id.name == name {
                return Some(task);
            }
            for id in next(task) {
                if seen.insert(id) {
                    if let Some(t) = self.job.task(id) {
                        queue.push_back(t);
                    }
                }
            }
        }
        None
    }

    /// Highest iteration index used by any task with this numeric id and replication.
    pub fn max_iteration(&self, id: u32, replication: u32) -> u32 {
        self.job
            .tasks()
            .filter(|t| t.id.id == id && t.id.replication == replication)
            .map(|t| t.id.iteration)
            .max()
            .unwrap_or(0)
    }

    /// Highest replication index used by any task with this numeric id and iteration.
    pub fn max_replication(&self, id: u32, iteration: u32) -> u32 {
        self.job
            .tasks()
            .filter(|t| t.id.id == id && t.id.iteration == iteration)
            .map(|t| t.id.replication)
            .max()
            .unwrap_or(0)
    }
}

/// Whether the job's current dependency relation is acyclic.
pub fn is_acyclic(job: &Job) -> bool {
    let mut graph = DiGraph::<&TaskId, ()>::new();
    let index: HashMap<&TaskId, NodeIndex> =
        job.tasks().map(|t| (&t.id, graph.add_node(&t.id))).collect();
    for task in job.tasks() {
        for dep in &task.dependencies {
            if let Some(from) = index.get(dep) {
                graph.add_edge(*from, index[&task.id], ());
            }
        }
    }
    toposort(&graph, None).is_ok()
}
