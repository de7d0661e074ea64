//! In-memory transactional backend.
//!
//! Sessions read from a snapshot taken at `begin` and buffer their writes;
//! commit replays the buffered writes onto the shared state, so concurrent
//! sessions on different jobs do not overwrite each other. Counters and
//! commit-failure injection make it usable as a test double.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use batchloom_types::error::StoreError;
use batchloom_types::ids::TaskId;
use batchloom_types::job::{Job, JobSummary};
use batchloom_types::task::Task;

use crate::repository::{AccessMode, JobSession, TransactionalBackend};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    jobs: BTreeMap<u64, Job>,
}

#[derive(Debug, Clone)]
enum Write {
    Job(Job),
    Tasks(Vec<Task>),
}

impl MemoryState {
    fn apply(&mut self, write: &Write) -> Result<(), StoreError> {
        match write {
            Write::Job(job) => {
                match self.jobs.get_mut(&job.id.id) {
                    Some(existing) => {
                        existing.owner = job.owner.clone();
                        existing.status = job.status;
                        existing.error = job.error.clone();
                        existing.finished_at = job.finished_at;
                    }
                    None => {
                        self.jobs.insert(job.id.id, job.header());
                    }
                }
                Ok(())
            }
            Write::Tasks(tasks) => {
                for task in tasks {
                    let job = self.jobs.get_mut(&task.id.job.id).ok_or_else(|| {
                        StoreError::Conflict(format!("task {} references unknown job", task.id))
                    })?;
                    job.put_task(task.clone());
                }
                Ok(())
            }
        }
    }
}

/// Session and commit counters.
#[derive(Debug, Default)]
pub struct MemoryStats {
    begun: AtomicU32,
    released: AtomicU32,
    commits: AtomicU32,
    rollbacks: AtomicU32,
}

impl MemoryStats {
    pub fn begun(&self) -> u32 {
        self.begun.load(Ordering::SeqCst)
    }

    /// Sessions begun but not yet released.
    pub fn open_sessions(&self) -> u32 {
        self.begun() - self.released.load(Ordering::SeqCst)
    }

    /// Successful commits.
    pub fn commits(&self) -> u32 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> u32 {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

/// Process-local backend holding every job in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    next_id: Arc<AtomicU64>,
    stats: Arc<MemoryStats>,
    failing_commits: Arc<AtomicU32>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &MemoryStats {
        &self.stats
    }

    /// Make the next `n` commits fail with [`StoreError::Busy`].
    pub fn fail_next_commits(&self, n: u32) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    fn snapshot(&self) -> Result<MemoryState, StoreError> {
        self.state
            .lock()
            .map(|state| state.clone())
            .map_err(|_| StoreError::Connection("memory store lock poisoned".into()))
    }
}

/// Session over a [`MemoryBackend`].
pub struct MemorySession {
    mode: AccessMode,
    view: MemoryState,
    writes: Vec<Write>,
    next_id: Arc<AtomicU64>,
    stats: Arc<MemoryStats>,
}

impl MemorySession {
    fn write(&mut self, write: Write) -> Result<(), StoreError> {
        if self.mode == AccessMode::ReadOnly {
            return Err(StoreError::Query("write in a read-only session".into()));
        }
        self.view.apply(&write)?;
        self.writes.push(write);
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.stats.released.fetch_add(1, Ordering::SeqCst);
    }
}

impl TransactionalBackend for MemoryBackend {
    type Session = MemorySession;

    async fn begin(&self, mode: AccessMode) -> Result<MemorySession, StoreError> {
        let view = self.snapshot()?;
        self.stats.begun.fetch_add(1, Ordering::SeqCst);
        Ok(MemorySession {
            mode,
            view,
            writes: Vec::new(),
            next_id: Arc::clone(&self.next_id),
            stats: Arc::clone(&self.stats),
        })
    }

    async fn commit(&self, session: MemorySession) -> Result<(), StoreError> {
        let pending = self.failing_commits.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_commits.store(pending - 1, Ordering::SeqCst);
            return Err(StoreError::Busy("injected commit failure".into()));
        }

        let mut state = self
            .state
            .lock()
            .map_err(|_| StoreError::Connection("memory store lock poisoned".into()))?;
        let mut next = state.clone();
        for write in &session.writes {
            next.apply(write)?;
        }
        *state = next;
        self.stats.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self, session: MemorySession) -> Result<(), StoreError> {
        self.stats.rollbacks.fetch_add(1, Ordering::SeqCst);
        drop(session);
        Ok(())
    }
}

impl JobSession for MemorySession {
    async fn next_job_id(&mut self) -> Result<u64, StoreError> {
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn save_job(&mut self, job: &Job) -> Result<(), StoreError> {
        self.write(Write::Job(job.header()))
    }

    async fn upsert_tasks(&mut self, tasks: &[Task]) -> Result<(), StoreError> {
        if tasks.is_empty() {
            return Ok(());
        }
        self.write(Write::Tasks(tasks.to_vec()))
    }

    async fn load_job(&mut self, id: u64) -> Result<Option<Job>, StoreError> {
        Ok(self.view.jobs.get(&id).cloned())
    }

    async fn load_task(&mut self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self
            .view
            .jobs
            .get(&id.job.id)
            .and_then(|job| job.task(id))
            .cloned())
    }

    async fn list_jobs(&mut self, unfinished_only: bool) -> Result<Vec<JobSummary>, StoreError> {
        Ok(self
            .view
            .jobs
            .values()
            .rev()
            .filter(|job| !unfinished_only || !job.is_terminal())
            .map(Job::summary)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchloom_types::executable::{ExecutableContainer, ExecutableDescription};
    use batchloom_types::ids::JobId;
    use batchloom_types::job::JobStatus;
    use chrono::Utc;

    fn job(id: u64) -> Job {
        let job_id = JobId::new(id, format!("job{id}"));
        let mut job = Job::new(job_id.clone(), "tester", Utc::now());
        job.put_task(Task::new(
            TaskId::new(job_id, 1, "a"),
            ExecutableContainer::new(ExecutableDescription {
                kind: "noop".into(),
                spec: serde_json::Value::Null,
            }),
        ));
        job
    }

    async fn insert(backend: &MemoryBackend, job: &Job) {
        let mut session = backend.begin(AccessMode::ReadWrite).await.unwrap();
        session.save_job(job).await.unwrap();
        let tasks: Vec<Task> = job.tasks().cloned().collect();
        session.upsert_tasks(&tasks).await.unwrap();
        backend.commit(session).await.unwrap();
    }

    #[tokio::test]
    async fn committed_writes_are_visible() {
        let backend = MemoryBackend::new();
        let j = job(1);
        insert(&backend, &j).await;

        let mut session = backend.begin(AccessMode::ReadOnly).await.unwrap();
        let loaded = session.load_job(1).await.unwrap().unwrap();
        assert_eq!(loaded, j);
        let task = session
            .load_task(&TaskId::new(j.id.clone(), 1, "a"))
            .await
            .unwrap();
        assert!(task.is_some());
    }

    #[tokio::test]
    async fn rolled_back_writes_are_discarded() {
        let backend = MemoryBackend::new();
        let mut session = backend.begin(AccessMode::ReadWrite).await.unwrap();
        session.save_job(&job(1)).await.unwrap();
        backend.rollback(session).await.unwrap();

        let mut session = backend.begin(AccessMode::ReadOnly).await.unwrap();
        assert!(session.load_job(1).await.unwrap().is_none());
        drop(session);
        assert_eq!(backend.stats().open_sessions(), 0);
    }

    #[tokio::test]
    async fn concurrent_sessions_do_not_clobber_each_other() {
        let backend = MemoryBackend::new();
        let mut first = backend.begin(AccessMode::ReadWrite).await.unwrap();
        let mut second = backend.begin(AccessMode::ReadWrite).await.unwrap();
        first.save_job(&job(1)).await.unwrap();
        second.save_job(&job(2)).await.unwrap();
        backend.commit(first).await.unwrap();
        backend.commit(second).await.unwrap();

        let mut session = backend.begin(AccessMode::ReadOnly).await.unwrap();
        assert_eq!(session.list_jobs(false).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn read_only_session_rejects_writes() {
        let backend = MemoryBackend::new();
        let mut session = backend.begin(AccessMode::ReadOnly).await.unwrap();
        assert!(session.save_job(&job(1)).await.is_err());
    }

    #[tokio::test]
    async fn tasks_for_unknown_job_conflict() {
        let backend = MemoryBackend::new();
        let j = job(5);
        let tasks: Vec<Task> = j.tasks().cloned().collect();
        let mut session = backend.begin(AccessMode::ReadWrite).await.unwrap();
        let err = session.upsert_tasks(&tasks).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn list_filters_terminal_jobs() {
        let backend = MemoryBackend::new();
        insert(&backend, &job(1)).await;
        let mut done = job(2);
        done.status = JobStatus::Finished;
        insert(&backend, &done).await;

        let mut session = backend.begin(AccessMode::ReadOnly).await.unwrap();
        let all = session.list_jobs(false).await.unwrap();
        assert_eq!(all.iter().map(|j| j.id.id).collect::<Vec<_>>(), vec![2, 1]);
        let open = session.list_jobs(true).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id.id, 1);
    }
}
