//! Application state wiring the scheduler to SQLite and the process worker.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use batchloom_core::Scheduler;
use batchloom_core::execution::{LocalAllocator, LocalDispatch};
use batchloom_infra::config::load_config;
use batchloom_infra::filesystem::{database_path, resolve_data_dir};
use batchloom_infra::sqlite::{DatabasePool, SqliteBackend};
use batchloom_infra::worker::local_dispatch;

/// The scheduler pinned to the infra implementations.
pub type BloomScheduler = Scheduler<SqliteBackend, LocalAllocator, LocalDispatch>;

pub struct AppState {
    pub scheduler: BloomScheduler,
    pub db_pool: DatabasePool,
}

impl AppState {
    /// Open the database, load `batchloom.toml`, and build the scheduler.
    pub async fn init(database: Option<&str>) -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("cannot create data directory {}", data_dir.display()))?;

        let config = load_config(&data_dir).await;

        let db_pool = match database {
            Some(url) if url.starts_with("sqlite:") => DatabasePool::new(url).await,
            Some(path) => DatabasePool::open(&PathBuf::from(path)).await,
            None => DatabasePool::open(&database_path(&data_dir)).await,
        }
        .context("failed to open the database")?;

        let scheduler = Scheduler::new(
            Arc::new(SqliteBackend::new(db_pool.clone())),
            LocalAllocator::new(config.execution.capacity),
            local_dispatch(),
            &config,
        )?;

        tracing::debug!(data_dir = %data_dir.display(), capacity = config.execution.capacity, "state ready");
        Ok(Self { scheduler, db_pool })
    }
}
