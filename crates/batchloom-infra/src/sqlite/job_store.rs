//! SQLite transactional backend.
//!
//! Implements `TransactionalBackend` and `JobSession` from `batchloom-core`.
//! A session is one sqlx transaction: read-only units of work run on the
//! reader pool, read-write ones on the single writer connection. Task
//! records are stored as JSON next to their key columns, and upserts by
//! `(job_id, task_id, iteration, replication)` make replaying the same
//! records harmless.

use batchloom_core::repository::{AccessMode, JobSession, TransactionalBackend};
use batchloom_types::error::StoreError;
use batchloom_types::ids::{JobId, TaskId};
use batchloom_types::job::{Job, JobStatus, JobSummary};
use batchloom_types::task::Task;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::{Row, Transaction};

use super::pool::DatabasePool;

/// SQLite-backed storage for jobs and tasks.
#[derive(Clone, Debug)]
pub struct SqliteBackend {
    pool: DatabasePool,
}

impl SqliteBackend {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }
}

/// One open transaction.
pub struct SqliteSession {
    tx: Transaction<'static, Sqlite>,
    mode: AccessMode,
}

impl SqliteSession {
    fn writable(&self) -> Result<(), StoreError> {
        match self.mode {
            AccessMode::ReadWrite => Ok(()),
            AccessMode::ReadOnly => Err(StoreError::Query("write in a read-only session".into())),
        }
    }
}

impl TransactionalBackend for SqliteBackend {
    type Session = SqliteSession;

    async fn begin(&self, mode: AccessMode) -> Result<SqliteSession, StoreError> {
        let pool = match mode {
            AccessMode::ReadOnly => &self.pool.reader,
            AccessMode::ReadWrite => &self.pool.writer,
        };
        let tx = pool.begin().await.map_err(map_sqlx_error)?;
        Ok(SqliteSession { tx, mode })
    }

    async fn commit(&self, session: SqliteSession) -> Result<(), StoreError> {
        session.tx.commit().await.map_err(map_sqlx_error)
    }

    async fn rollback(&self, session: SqliteSession) -> Result<(), StoreError> {
        session.tx.rollback().await.map_err(map_sqlx_error)
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct JobRow {
    id: i64,
    name: String,
    owner: String,
    status: String,
    error: Option<String>,
    submitted_at: String,
    finished_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            owner: row.try_get("owner")?,
            status: row.try_get("status")?,
            error: row.try_get("error")?,
            submitted_at: row.try_get("submitted_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    fn into_job(self) -> Result<Job, StoreError> {
        let mut job = Job::new(
            JobId::new(self.id as u64, self.name),
            self.owner,
            parse_datetime(&self.submitted_at)?,
        );
        job.status = parse_status(&self.status)?;
        job.error = self.error;
        job.finished_at = self.finished_at.as_deref().map(parse_datetime).transpose()?;
        Ok(job)
    }
}

fn parse_task(row: &SqliteRow) -> Result<Task, StoreError> {
    let record: String = row.try_get("record").map_err(map_sqlx_error)?;
    serde_json::from_str(&record)
        .map_err(|e| StoreError::Serialization(format!("invalid task record: {e}")))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_status(s: &str) -> Result<JobStatus, StoreError> {
    s.parse::<JobStatus>().map_err(StoreError::Serialization)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Classify a sqlx error. Lock contention becomes `Busy`, constraint
/// violations `Conflict`, pool and I/O trouble `Connection`.
pub(crate) fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => {
            let primary = db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| code & 0xff);
            // SQLITE_BUSY, SQLITE_LOCKED
            if matches!(primary, Some(5) | Some(6)) {
                StoreError::Busy(db.message().to_string())
            } else if db.is_foreign_key_violation() || db.is_unique_violation() {
                StoreError::Conflict(db.message().to_string())
            } else {
                StoreError::Query(db.message().to_string())
            }
        }
        sqlx::Error::PoolTimedOut => StoreError::Busy(err.to_string()),
        sqlx::Error::RowNotFound => StoreError::NotFound,
        sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
            StoreError::Connection(err.to_string())
        }
        _ => StoreError::Query(err.to_string()),
    }
}

// ---------------------------------------------------------------------------
// JobSession impl
// ---------------------------------------------------------------------------

impl JobSession for SqliteSession {
    async fn next_job_id(&mut self) -> Result<u64, StoreError> {
        self.writable()?;
        let row: (i64,) = sqlx::query_as(
            "UPDATE job_sequence SET value = value + 1 WHERE singleton = 1 RETURNING value",
        )
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        Ok(row.0 as u64)
    }

    async fn save_job(&mut self, job: &Job) -> Result<(), StoreError> {
        self.writable()?;
        sqlx::query(
            r#"INSERT INTO jobs (id, name, owner, status, error, submitted_at, finished_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 error = excluded.error,
                 finished_at = excluded.finished_at"#,
        )
        .bind(job.id.id as i64)
        .bind(&job.id.name)
        .bind(&job.owner)
        .bind(job.status.as_str())
        .bind(&job.error)
        .bind(format_datetime(&job.submitted_at))
        .bind(job.finished_at.as_ref().map(format_datetime))
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn upsert_tasks(&mut self, tasks: &[Task]) -> Result<(), StoreError> {
        if tasks.is_empty() {
            return Ok(());
        }
        self.writable()?;
        let now = format_datetime(&Utc::now());
        for task in tasks {
            let record = serde_json::to_string(task)
                .map_err(|e| StoreError::Serialization(format!("serialize task {}: {e}", task.id)))?;
            sqlx::query(
                r#"INSERT INTO tasks
                   (job_id, task_id, iteration, replication, name, status, attempts, record, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                   ON CONFLICT(job_id, task_id, iteration, replication) DO UPDATE SET
                     status = excluded.status,
                     attempts = excluded.attempts,
                     record = excluded.record,
                     updated_at = excluded.updated_at"#,
            )
            .bind(task.id.job.id as i64)
            .bind(task.id.id as i64)
            .bind(task.id.iteration as i64)
            .bind(task.id.replication as i64)
            .bind(&task.id.name)
            .bind(task.status.as_str())
            .bind(task.attempts as i64)
            .bind(&record)
            .bind(&now)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        }
        tracing::trace!(tasks = tasks.len(), "upserted task records");
        Ok(())
    }

    async fn load_job(&mut self, id: u64) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, owner, status, error, submitted_at, finished_at FROM jobs WHERE id = ?",
        )
        .bind(id as i64)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut job = JobRow::from_row(&row).map_err(map_sqlx_error)?.into_job()?;

        let rows = sqlx::query(
            "SELECT record FROM tasks WHERE job_id = ? ORDER BY task_id, iteration, replication",
        )
        .bind(id as i64)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        for row in &rows {
            job.put_task(parse_task(row)?);
        }
        Ok(Some(job))
    }

    async fn load_task(&mut self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(
            "SELECT record FROM tasks WHERE job_id = ? AND task_id = ? AND iteration = ? AND replication = ?",
        )
        .bind(id.job.id as i64)
        .bind(id.id as i64)
        .bind(id.iteration as i64)
        .bind(id.replication as i64)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        row.as_ref().map(parse_task).transpose()
    }

    async fn list_jobs(&mut self, unfinished_only: bool) -> Result<Vec<JobSummary>, StoreError> {
        let sql = if unfinished_only {
            r#"SELECT j.id, j.name, j.owner, j.status, j.error, j.submitted_at, j.finished_at,
                      (SELECT COUNT(*) FROM tasks t WHERE t.job_id = j.id) AS task_count
               FROM jobs j WHERE j.status IN ('pending', 'running') ORDER BY j.id DESC"#
        } else {
            r#"SELECT j.id, j.name, j.owner, j.status, j.error, j.submitted_at, j.finished_at,
                      (SELECT COUNT(*) FROM tasks t WHERE t.job_id = j.id) AS task_count
               FROM jobs j ORDER BY j.id DESC"#
        };
        let rows = sqlx::query(sql)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in &rows {
            let task_count: i64 = row.try_get("task_count").map_err(map_sqlx_error)?;
            let job = JobRow::from_row(row).map_err(map_sqlx_error)?.into_job()?;
            let mut summary = job.summary();
            summary.task_count = task_count as usize;
            summaries.push(summary);
        }
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchloom_types::executable::{ExecutableContainer, ExecutableDescription};
    use batchloom_types::task::TaskStatus;

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    fn sample_job(id: u64, tasks: &[&str]) -> Job {
        let job_id = JobId::new(id, format!("nightly-{id}"));
        let mut job = Job::new(job_id.clone(), "ops", Utc::now());
        for (i, name) in tasks.iter().enumerate() {
            let mut task = Task::new(
                TaskId::new(job_id.clone(), i as u32 + 1, *name),
                ExecutableContainer::new(ExecutableDescription {
                    kind: "command".into(),
                    spec: serde_json::json!({ "program": "true" }),
                }),
            );
            if i > 0 {
                task.add_dependency(TaskId::new(job_id.clone(), i as u32, tasks[i - 1]));
            }
            job.put_task(task);
        }
        job
    }

    async fn insert(backend: &SqliteBackend, job: &Job) {
        let mut session = backend.begin(AccessMode::ReadWrite).await.unwrap();
        session.save_job(job).await.unwrap();
        let tasks: Vec<Task> = job.tasks().cloned().collect();
        session.upsert_tasks(&tasks).await.unwrap();
        backend.commit(session).await.unwrap();
    }

    #[tokio::test]
    async fn test_job_round_trip() {
        let backend = SqliteBackend::new(test_pool().await);
        let job = sample_job(1, &["extract", "load"]);
        insert(&backend, &job).await;

        let mut session = backend.begin(AccessMode::ReadOnly).await.unwrap();
        let loaded = session.load_job(1).await.unwrap().unwrap();
        assert_eq!(loaded.id.name, "nightly-1");
        assert_eq!(loaded.owner, "ops");
        assert_eq!(loaded.status, JobStatus::Pending);
        assert_eq!(loaded.task_count(), 2);
        let load = loaded
            .tasks()
            .find(|t| t.id.name == "load")
            .unwrap();
        assert_eq!(load.dependencies.len(), 1);
        assert_eq!(load.dependencies[0].name, "extract");

        assert!(session.load_job(99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_replay_is_idempotent() {
        let backend = SqliteBackend::new(test_pool().await);
        let mut job = sample_job(1, &["a"]);
        insert(&backend, &job).await;
        insert(&backend, &job).await;

        let mut task = job.tasks().next().unwrap().clone();
        task.status = TaskStatus::Running;
        task.attempts = 1;
        job.put_task(task.clone());
        insert(&backend, &job).await;

        let mut session = backend.begin(AccessMode::ReadOnly).await.unwrap();
        let loaded = session.load_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Running);
        assert_eq!(loaded.attempts, 1);
        assert_eq!(session.load_job(1).await.unwrap().unwrap().task_count(), 1);
    }

    #[tokio::test]
    async fn test_loop_and_replica_instances_are_distinct_rows() {
        let backend = SqliteBackend::new(test_pool().await);
        let job = sample_job(1, &["a"]);
        insert(&backend, &job).await;

        let original = job.tasks().next().unwrap();
        let looped = original.duplicate(original.id.with_iteration(1), vec![original.id.clone()]);
        let replica = original.duplicate(original.id.with_replication(1), Vec::new());
        let mut session = backend.begin(AccessMode::ReadWrite).await.unwrap();
        session.upsert_tasks(&[looped, replica]).await.unwrap();
        backend.commit(session).await.unwrap();

        let mut session = backend.begin(AccessMode::ReadOnly).await.unwrap();
        let loaded = session.load_job(1).await.unwrap().unwrap();
        let names: Vec<String> = loaded.tasks().map(|t| t.id.readable_name()).collect();
        assert_eq!(names, vec!["a", "a*1", "a#1"]);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let backend = SqliteBackend::new(test_pool().await);
        let mut session = backend.begin(AccessMode::ReadWrite).await.unwrap();
        session.save_job(&sample_job(1, &[])).await.unwrap();
        backend.rollback(session).await.unwrap();

        let mut session = backend.begin(AccessMode::ReadOnly).await.unwrap();
        assert!(session.load_job(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_next_job_id_is_monotonic() {
        let backend = SqliteBackend::new(test_pool().await);
        let mut ids = Vec::new();
        for _ in 0..3 {
            let mut session = backend.begin(AccessMode::ReadWrite).await.unwrap();
            ids.push(session.next_job_id().await.unwrap());
            backend.commit(session).await.unwrap();
        }
        assert_eq!(ids, vec![1, 2, 3]);

        // A rolled back reservation is handed out again.
        let mut session = backend.begin(AccessMode::ReadWrite).await.unwrap();
        assert_eq!(session.next_job_id().await.unwrap(), 4);
        backend.rollback(session).await.unwrap();
        let mut session = backend.begin(AccessMode::ReadWrite).await.unwrap();
        assert_eq!(session.next_job_id().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_read_only_session_rejects_writes() {
        let backend = SqliteBackend::new(test_pool().await);
        let mut session = backend.begin(AccessMode::ReadOnly).await.unwrap();
        assert!(matches!(
            session.save_job(&sample_job(1, &[])).await,
            Err(StoreError::Query(_))
        ));
    }

    #[tokio::test]
    async fn test_tasks_of_unknown_job_conflict() {
        let backend = SqliteBackend::new(test_pool().await);
        let job = sample_job(7, &["a"]);
        let tasks: Vec<Task> = job.tasks().cloned().collect();
        let mut session = backend.begin(AccessMode::ReadWrite).await.unwrap();
        let err = session.upsert_tasks(&tasks).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_list_jobs_newest_first_with_filter() {
        let backend = SqliteBackend::new(test_pool().await);
        insert(&backend, &sample_job(1, &["a", "b"])).await;
        let mut done = sample_job(2, &["a"]);
        done.status = JobStatus::Finished;
        done.finished_at = Some(Utc::now());
        insert(&backend, &done).await;

        let mut session = backend.begin(AccessMode::ReadOnly).await.unwrap();
        let all = session.list_jobs(false).await.unwrap();
        assert_eq!(all.iter().map(|j| j.id.id).collect::<Vec<_>>(), vec![2, 1]);
        assert_eq!(all[1].task_count, 2);
        assert!(all[0].finished_at.is_some());

        let open = session.list_jobs(true).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id.id, 1);
    }
}
