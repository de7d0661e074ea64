//! Per-task lifecycle: state transitions and re-execution delay.

pub mod lifecycle;
pub mod restart;

pub use lifecycle::{FaultDisposition, Readiness, TaskLifecycle};
pub use restart::RestartPolicy;
