//! Running task attempts: capacity, dispatch and supervision.

pub mod dispatch;
pub mod supervisor;

pub use dispatch::{
    Executable, ExecutableResolver, ExecutionContext, ExecutionFailure, LocalAllocator,
    LocalDispatch, ResourceAllocator, WorkerDispatch,
};
pub use supervisor::{ExecutionSupervisor, SupervisedExecution, SupervisionOutcome};
