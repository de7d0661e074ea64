//! Identity types for jobs and tasks.
//!
//! Both identities carry a human-readable name for display, but equality,
//! hashing and ordering only consider the numeric components. Two `TaskId`s
//! with the same job, numeric id, iteration and replication are the same
//! logical task instance even if their names differ.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Identifier of a submitted job: monotonic numeric id plus a display name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobId {
    pub id: u64,
    pub name: String,
}

impl JobId {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

impl PartialEq for JobId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for JobId {}

impl Hash for JobId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for JobId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for JobId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.id)
    }
}

/// Identifier of one task instance inside a job.
///
/// `iteration` is bumped every time a LOOP duplicates the task, `replication`
/// distinguishes the parallel copies produced by REPLICATE. The original
/// task of a static graph has both set to zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskId {
    pub job: JobId,
    pub id: u32,
    pub name: String,
    pub iteration: u32,
    pub replication: u32,
}

impl TaskId {
    pub fn new(job: JobId, id: u32, name: impl Into<String>) -> Self {
        Self {
            job,
            id,
            name: name.into(),
            iteration: 0,
            replication: 0,
        }
    }

    /// Copy of this id with a different iteration index.
    pub fn with_iteration(&self, iteration: u32) -> Self {
        Self {
            iteration,
            ..self.clone()
        }
    }

    /// Copy of this id with a different replication index.
    pub fn with_replication(&self, replication: u32) -> Self {
        Self {
            replication,
            ..self.clone()
        }
    }

    /// The `(id, iteration, replication)` triple, unique within one job.
    pub fn key(&self) -> (u32, u32, u32) {
        (self.id, self.iteration, self.replication)
    }

    /// Display name including loop and replica suffixes: `name#iteration*replication`.
    pub fn readable_name(&self) -> String {
        let mut name = self.name.clone();
        if self.iteration > 0 {
            name.push_str(&format!("#{}", self.iteration));
        }
        if self.replication > 0 {
            name.push_str(&format!("*{}", self.replication));
        }
        name
    }
}

impl PartialEq for TaskId {
    fn eq(&self, other: &Self) -> bool {
        self.job == other.job && self.key() == other.key()
    }
}

impl Eq for TaskId {}

impl Hash for TaskId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.job.hash(state);
        self.key().hash(state);
    }
}

impl PartialOrd for TaskId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TaskId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.job
            .cmp(&other.job)
            .then_with(|| self.key().cmp(&other.key()))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.job.id, self.readable_name())
    }
}
