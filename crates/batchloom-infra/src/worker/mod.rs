//! Worker-side executable resolvers.

pub mod process;

pub use process::{COMMAND_KIND, CommandExecutable, ProcessResolver};

use batchloom_core::execution::LocalDispatch;

/// Local dispatch with every resolver this crate provides registered.
pub fn local_dispatch() -> LocalDispatch {
    LocalDispatch::new().with_resolver(ProcessResolver::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use batchloom_core::Scheduler;
    use batchloom_core::execution::LocalAllocator;
    use batchloom_types::config::{RestartConfig, SchedulerConfig};
    use batchloom_types::executable::ExecutableDescription;
    use batchloom_types::job::{JobStatus, JobSubmission, TaskSubmission};
    use batchloom_types::task::{TaskResult, TaskStatus};
    use serde_json::json;

    use crate::sqlite::{DatabasePool, SqliteBackend};

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    fn command(name: &str, deps: &[&str], script: &str) -> TaskSubmission {
        TaskSubmission {
            name: name.into(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            executable: ExecutableDescription {
                kind: COMMAND_KIND.into(),
                spec: json!({ "program": "sh", "args": ["-c", script] }),
            },
            credentials: None,
            run_as_user: false,
            flow: None,
            block_end: None,
            max_executions_on_failure: 1,
            cancel_job_on_error: false,
            timeout_ms: None,
            nodes: 1,
        }
    }

    #[tokio::test]
    async fn commands_run_to_completion_over_sqlite() {
        let pool = test_pool().await;
        let backend = Arc::new(SqliteBackend::new(pool.clone()));
        let mut config = SchedulerConfig::default();
        config.restart = RestartConfig::immediate();
        let scheduler = Scheduler::new(
            backend,
            LocalAllocator::new(config.execution.capacity),
            local_dispatch(),
            &config,
        )
        .unwrap();

        let id = scheduler
            .submit_job(JobSubmission {
                name: "fanout".into(),
                owner: None,
                tasks: vec![
                    command("split", &[], "echo '::flow:: replicate 2'; echo '{\"parts\": 2}'"),
                    command("work", &["split"], "echo done"),
                    command("merge", &["work"], "echo merged"),
                ],
            })
            .await
            .unwrap();

        assert_eq!(scheduler.wait_job(id.id).await.unwrap(), JobStatus::Finished);
        assert!(!scheduler.is_live(id.id));

        // Everything below is read back from SQLite.
        let job = scheduler.job_snapshot(id.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Finished);
        assert_eq!(job.task_count(), 4);
        assert!(job.tasks().all(|t| t.status == TaskStatus::Finished));

        let split = job.tasks().find(|t| t.id.name == "split").unwrap();
        match &split.result {
            Some(TaskResult::Success { output }) => assert_eq!(output.value, json!({ "parts": 2 })),
            other => panic!("unexpected result {other:?}"),
        }
        let merge = job.tasks().find(|t| t.id.name == "merge").unwrap();
        assert_eq!(merge.dependencies.len(), 2);

        let listed = scheduler.list_jobs(false).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].task_count, 4);
    }

    #[tokio::test]
    async fn failing_command_is_faulty_and_blocks_dependents() {
        let backend = Arc::new(SqliteBackend::new(test_pool().await));
        let mut config = SchedulerConfig::default();
        config.restart = RestartConfig::immediate();
        let scheduler = Scheduler::new(backend, LocalAllocator::new(2), local_dispatch(), &config).unwrap();

        let mut flaky = command("flaky", &[], "exit 1");
        flaky.max_executions_on_failure = 2;
        let id = scheduler
            .submit_job(JobSubmission {
                name: "broken".into(),
                owner: Some("ops".into()),
                tasks: vec![flaky, command("after", &["flaky"], "echo unreachable")],
            })
            .await
            .unwrap();

        assert_eq!(scheduler.wait_job(id.id).await.unwrap(), JobStatus::Finished);
        let job = scheduler.job_snapshot(id.id).await.unwrap();
        let flaky = job.tasks().find(|t| t.id.name == "flaky").unwrap();
        assert_eq!(flaky.status, TaskStatus::Faulty);
        assert_eq!(flaky.attempts, 2);
        let after = job.tasks().find(|t| t.id.name == "after").unwrap();
        assert_eq!(after.status, TaskStatus::Failed);
    }
}
