//! Transactional unit-of-work runner.
//!
//! Runs a caller-supplied unit of work inside a fresh session, retrying with
//! exponential backoff on any failure. Callers only ever see the final
//! success or a [`SchedulerError::StorageExhausted`] carrying the last cause.
//!
//! A unit of work is a closure invoked once per attempt. It must own what it
//! needs (clone into the returned future) since the future may only borrow
//! the session:
//!
//! ```ignore
//! let records = records.clone();
//! runner
//!     .run_read_write(move |session| {
//!         let records = records.clone();
//!         Box::pin(async move { session.upsert_tasks(&records).await })
//!     })
//!     .await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use batchloom_types::config::TransactionConfig;
use batchloom_types::error::{SchedulerError, StoreError};
use futures_util::future::BoxFuture;

use crate::repository::{AccessMode, TransactionalBackend};

/// Retrying executor of units of work against one backend.
pub struct UnitOfWorkRunner<B> {
    backend: Arc<B>,
    config: TransactionConfig,
}

impl<B> Clone for UnitOfWorkRunner<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            config: self.config.clone(),
        }
    }
}

impl<B: TransactionalBackend> UnitOfWorkRunner<B> {
    /// Build a runner; rejects `initial_delay_ms == 0` and `damping_factor < 1`.
    pub fn new(backend: Arc<B>, config: TransactionConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        Ok(Self { backend, config })
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Run a unit of work that only reads. Never rolls back.
    pub async fn run_read_only<T, F>(&self, work: F) -> Result<T, SchedulerError>
    where
        T: Send,
        F: for<'s> Fn(&'s mut B::Session) -> BoxFuture<'s, Result<T, StoreError>> + Send + Sync,
    {
        self.run(AccessMode::ReadOnly, work).await
    }

    /// Run a unit of work that writes. Failed attempts are rolled back.
    pub async fn run_read_write<T, F>(&self, work: F) -> Result<T, SchedulerError>
    where
        T: Send,
        F: for<'s> Fn(&'s mut B::Session) -> BoxFuture<'s, Result<T, StoreError>> + Send + Sync,
    {
        self.run(AccessMode::ReadWrite, work).await
    }

    async fn run<T, F>(&self, mode: AccessMode, work: F) -> Result<T, SchedulerError>
    where
        T: Send,
        F: for<'s> Fn(&'s mut B::Session) -> BoxFuture<'s, Result<T, StoreError>> + Send + Sync,
    {
        let attempts = self.config.max_retries + 1;
        let mut delay = self.config.initial_delay();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match self.attempt(mode, &work).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if attempt >= attempts {
                tracing::error!(attempts, error = %err, ?mode, "unit of work exhausted its retries");
                return Err(SchedulerError::StorageExhausted {
                    attempts,
                    source: err,
                });
            }

            tracing::warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                ?mode,
                "unit of work failed, retrying"
            );
            tokio::time::sleep(delay).await;
            delay = next_delay(delay, self.config.damping_factor);
        }
    }

    async fn attempt<T, F>(&self, mode: AccessMode, work: &F) -> Result<T, StoreError>
    where
        T: Send,
        F: for<'s> Fn(&'s mut B::Session) -> BoxFuture<'s, Result<T, StoreError>> + Send + Sync,
    {
        let mut session = self.backend.begin(mode).await?;
        match work(&mut session).await {
            Ok(value) => {
                self.backend.commit(session).await?;
                Ok(value)
            }
            Err(err) => {
                if mode == AccessMode::ReadWrite {
                    if let Err(rollback_err) = self.backend.rollback(session).await {
                        tracing::warn!(error = %rollback_err, "rollback failed");
                    }
                }
                // Read-only sessions are released on drop.
                Err(err)
            }
        }
    }
}

fn next_delay(delay: Duration, damping_factor: f64) -> Duration {
    delay.mul_f64(damping_factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::JobSession;
    use crate::store::MemoryBackend;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(max_retries: u32, initial_delay_ms: u64, damping_factor: f64) -> TransactionConfig {
        TransactionConfig {
            max_retries,
            initial_delay_ms,
            damping_factor,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_work_is_attempted_max_retries_plus_one_times() {
        let backend = Arc::new(MemoryBackend::new());
        let runner = UnitOfWorkRunner::new(backend.clone(), config(2, 100, 2.0)).unwrap();
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let start = tokio::time::Instant::now();

        let seen = calls.clone();
        let result: Result<(), _> = runner
            .run_read_write(move |_session| {
                seen.lock().unwrap().push(start.elapsed());
                let n = seen.lock().unwrap().len();
                Box::pin(async move { Err(StoreError::Busy(format!("locked #{n}"))) })
            })
            .await;

        let calls = calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0], Duration::ZERO);
        assert_eq!(calls[1], Duration::from_millis(100));
        assert_eq!(calls[2], Duration::from_millis(300));

        match result {
            Err(SchedulerError::StorageExhausted { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert_eq!(source.to_string(), "storage busy: locked #3");
            }
            other => panic!("expected StorageExhausted, got {other:?}"),
        }
        assert_eq!(backend.stats().rollbacks(), 3);
        assert_eq!(backend.stats().open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_absorbed() {
        let backend = Arc::new(MemoryBackend::new());
        let runner = UnitOfWorkRunner::new(backend.clone(), config(3, 10, 1.0)).unwrap();
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let id = runner
            .run_read_write(move |session| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    if n == 0 {
                        return Err(StoreError::Connection("blip".into()));
                    }
                    session.next_job_id().await
                })
            })
            .await
            .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(id >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn read_only_never_rolls_back_but_still_retries() {
        let backend = Arc::new(MemoryBackend::new());
        let runner = UnitOfWorkRunner::new(backend.clone(), config(1, 50, 2.0)).unwrap();
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let result: Result<(), _> = runner
            .run_read_only(move |_session| {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Err(StoreError::Query("bad".into())) })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(backend.stats().rollbacks(), 0);
        assert_eq!(backend.stats().open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn commit_failure_is_retried() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_next_commits(1);
        let runner = UnitOfWorkRunner::new(backend.clone(), config(2, 10, 2.0)).unwrap();

        let id = runner
            .run_read_write(|session| Box::pin(async move { session.next_job_id().await }))
            .await
            .unwrap();
        assert!(id >= 1);
        assert_eq!(backend.stats().commits(), 1);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let backend = Arc::new(MemoryBackend::new());
        assert!(UnitOfWorkRunner::new(backend.clone(), config(1, 0, 2.0)).is_err());
        assert!(UnitOfWorkRunner::new(backend, config(1, 10, 0.9)).is_err());
    }

    #[test]
    fn delay_grows_by_damping_factor() {
        let d = next_delay(Duration::from_millis(100), 2.0);
        assert_eq!(d, Duration::from_millis(200));
        assert_eq!(next_delay(d, 1.5), Duration::from_millis(300));
    }
}
