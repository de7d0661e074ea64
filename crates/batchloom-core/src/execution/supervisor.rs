//! Timeout-aware execution supervision.
//!
//! An execution is a future spawned on its own tokio task and handed an
//! interrupt token. The supervisor races it against a deadline and against
//! the caller's cancel handle, and reports which of the three ended it. A
//! timeout runs the caller's timeout action once; a caller cancel never
//! does. Either way the interrupt token is cancelled so a cooperative
//! executable can unwind.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

/// How a supervised execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisionOutcome<T> {
    /// The executable returned on its own.
    Completed(T),
    /// The deadline passed first. The timeout action has run.
    TimedOut { after: Duration },
    /// The caller cancelled it. No timeout action.
    Cancelled,
    /// The executable panicked or its task was torn down.
    Crashed { message: String },
}

/// Handle to one execution under supervision.
///
/// Resolves as soon as the outcome is known; after an interrupt this does not
/// wait for the executable to finish unwinding.
#[must_use = "an execution keeps running until it completes or is cancelled"]
pub struct SupervisedExecution<T> {
    outcome: oneshot::Receiver<SupervisionOutcome<T>>,
    cancel: CancellationToken,
}

impl<T> SupervisedExecution<T> {
    /// Cancel on behalf of the caller.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this execution when triggered, for holders that
    /// cannot keep the handle itself.
    pub fn canceller(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl<T> Future for SupervisedExecution<T> {
    type Output = SupervisionOutcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.outcome).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(SupervisionOutcome::Crashed {
                message: "supervisor dropped before reporting".to_string(),
            }),
            Poll::Pending => Poll::Pending,
        }
    }
}

enum Interrupt {
    Timeout,
    Caller,
}

/// Runs executions with a deadline and a caller-side cancel.
#[derive(Debug, Clone, Default)]
pub struct ExecutionSupervisor {
    kill_grace: Option<Duration>,
}

impl ExecutionSupervisor {
    /// `kill_grace` bounds how long an interrupted executable may keep running
    /// before its task is aborted. `None` waits for it indefinitely.
    pub fn new(kill_grace: Option<Duration>) -> Self {
        Self { kill_grace }
    }

    /// Start `executable` and supervise it.
    ///
    /// `on_timeout` runs exactly once if the deadline passes before completion
    /// or caller cancel, and never otherwise.
    pub fn submit_with_timeout<T, F, Fut, A>(
        &self,
        executable: F,
        timeout: Duration,
        on_timeout: A,
    ) -> SupervisedExecution<T>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        A: FnOnce() + Send + 'static,
    {
        let interrupt = CancellationToken::new();
        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        let mut worker = tokio::spawn(executable(interrupt.clone()));
        let caller = cancel.clone();
        let kill_grace = self.kill_grace;

        tokio::spawn(async move {
            let reason = tokio::select! {
                biased;
                joined = &mut worker => {
                    let _ = tx.send(completed(joined));
                    return;
                }
                _ = caller.cancelled() => Interrupt::Caller,
                _ = tokio::time::sleep(timeout) => Interrupt::Timeout,
            };

            interrupt.cancel();
            let outcome = match reason {
                Interrupt::Timeout => {
                    on_timeout();
                    SupervisionOutcome::TimedOut { after: timeout }
                }
                Interrupt::Caller => SupervisionOutcome::Cancelled,
            };
            let _ = tx.send(outcome);

            match kill_grace {
                Some(grace) => {
                    if tokio::time::timeout(grace, &mut worker).await.is_err() {
                        tracing::warn!(
                            grace_ms = grace.as_millis() as u64,
                            "executable ignored interrupt, aborting it"
                        );
                        worker.abort();
                    }
                }
                None => {
                    let _ = worker.await;
                }
            }
        });

        SupervisedExecution { outcome: rx, cancel }
    }
}

fn completed<T>(joined: Result<T, JoinError>) -> SupervisionOutcome<T> {
    match joined {
        Ok(value) => SupervisionOutcome::Completed(value),
        Err(err) if err.is_panic() => SupervisionOutcome::Crashed {
            message: format!("executable panicked: {err}"),
        },
        Err(err) => SupervisionOutcome::Crashed {
            message: err.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Sleeps for `work`, reporting through the returned receiver whether it
    /// saw the interrupt first.
    fn sleeper(
        work: Duration,
    ) -> (
        impl FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = &'static str> + Send>>,
        oneshot::Receiver<bool>,
    ) {
        let (seen_tx, seen_rx) = oneshot::channel();
        let exec = move |interrupt: CancellationToken| -> Pin<Box<dyn Future<Output = &'static str> + Send>> {
            Box::pin(async move {
                tokio::select! {
                    _ = interrupt.cancelled() => {
                        let _ = seen_tx.send(true);
                        "interrupted"
                    }
                    _ = tokio::time::sleep(work) => {
                        let _ = seen_tx.send(false);
                        "done"
                    }
                }
            })
        };
        (exec, seen_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_runs_action_once_and_interrupts_worker() {
        let supervisor = ExecutionSupervisor::new(None);
        let fired = Arc::new(AtomicU32::new(0));
        let (exec, seen) = sleeper(Duration::from_secs(10));

        let counter = fired.clone();
        let start = tokio::time::Instant::now();
        let outcome = supervisor
            .submit_with_timeout(exec, Duration::from_millis(1000), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert_eq!(
            outcome,
            SupervisionOutcome::TimedOut {
                after: Duration::from_millis(1000)
            }
        );
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1000) && elapsed < Duration::from_millis(1100));
        assert!(seen.await.unwrap(), "worker should observe the interrupt");
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn caller_cancel_skips_timeout_action() {
        let supervisor = ExecutionSupervisor::new(None);
        let fired = Arc::new(AtomicU32::new(0));
        let (exec, seen) = sleeper(Duration::from_secs(10));

        let counter = fired.clone();
        let execution = supervisor.submit_with_timeout(exec, Duration::from_millis(1000), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let canceller = execution.canceller();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            canceller.cancel();
        });

        assert_eq!(execution.await, SupervisionOutcome::Cancelled);
        assert!(seen.await.unwrap());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_before_deadline_returns_value() {
        let supervisor = ExecutionSupervisor::new(None);
        let fired = Arc::new(AtomicU32::new(0));
        let (exec, seen) = sleeper(Duration::from_millis(200));

        let counter = fired.clone();
        let outcome = supervisor
            .submit_with_timeout(exec, Duration::from_secs(1), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert_eq!(outcome, SupervisionOutcome::Completed("done"));
        assert!(!seen.await.unwrap());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stubborn_executable_is_aborted_after_grace() {
        let supervisor = ExecutionSupervisor::new(Some(Duration::from_millis(100)));
        let finished = Arc::new(AtomicU32::new(0));

        let flag = finished.clone();
        let outcome = supervisor
            .submit_with_timeout(
                move |_interrupt| async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    flag.fetch_add(1, Ordering::SeqCst);
                },
                Duration::from_millis(50),
                || {},
            )
            .await;

        assert!(matches!(outcome, SupervisionOutcome::TimedOut { .. }));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    fn explode() {
        panic!("worker exploded");
    }

    #[tokio::test]
    async fn panic_is_reported_as_crash() {
        let supervisor = ExecutionSupervisor::default();
        let outcome: SupervisionOutcome<()> = supervisor
            .submit_with_timeout(
                |_interrupt| async { explode() },
                Duration::from_secs(5),
                || {},
            )
            .await;

        match outcome {
            SupervisionOutcome::Crashed { message } => assert!(message.contains("panicked")),
            other => panic!("expected crash, got {other:?}"),
        }
    }
}
