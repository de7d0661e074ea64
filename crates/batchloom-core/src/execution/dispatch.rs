//! Capacity allocation and worker dispatch.
//!
//! The scheduler asks a [`ResourceAllocator`] for a worker, then ships the
//! task's [`ExecutableContainer`] to it through a [`WorkerDispatch`]. The
//! container is only turned into something runnable on the worker side, by
//! an [`ExecutableResolver`] registered for its `kind`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use batchloom_types::error::SchedulerError;
use batchloom_types::executable::{
    Credentials, ExecutableContainer, ExecutableDescription, NodeHandle, ResourceRequirements,
    TaskOutput, WorkerHandle,
};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Failure reported by an executable. Counted against the task's retry budget.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ExecutionFailure {
    pub message: String,
}

impl ExecutionFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Allocation
// ---------------------------------------------------------------------------

/// Supplier of execution capacity.
pub trait ResourceAllocator: Send + Sync + 'static {
    /// Wait for a worker satisfying `requirements`.
    ///
    /// An error means the request can never be met; the attempt is counted as
    /// faulty with a resource-unavailable cause.
    fn acquire(
        &self,
        requirements: ResourceRequirements,
    ) -> impl Future<Output = Result<WorkerHandle, SchedulerError>> + Send;

    fn release(&self, worker: WorkerHandle) -> impl Future<Output = ()> + Send;
}

/// In-process allocator handing out a fixed number of node slots.
#[derive(Debug)]
pub struct LocalAllocator {
    slots: Arc<Semaphore>,
    capacity: u32,
    leases: DashMap<Uuid, OwnedSemaphorePermit>,
}

impl LocalAllocator {
    pub fn new(capacity: usize) -> Self {
        let capacity = u32::try_from(capacity.max(1)).unwrap_or(u32::MAX);
        Self {
            slots: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
            leases: DashMap::new(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Free node slots right now.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}

impl ResourceAllocator for LocalAllocator {
    async fn acquire(&self, requirements: ResourceRequirements) -> Result<WorkerHandle, SchedulerError> {
        let nodes = requirements.nodes.max(1);
        if nodes > self.capacity {
            return Err(SchedulerError::ResourceUnavailable(format!(
                "task needs {nodes} nodes, local capacity is {}",
                self.capacity
            )));
        }

        let permit = Arc::clone(&self.slots)
            .acquire_many_owned(nodes)
            .await
            .map_err(|_| SchedulerError::ResourceUnavailable("allocator is closed".into()))?;

        let id = Uuid::now_v7();
        let handle = WorkerHandle {
            id,
            nodes: (0..nodes)
                .map(|slot| NodeHandle {
                    name: format!("local/{slot}"),
                })
                .collect(),
        };
        self.leases.insert(id, permit);
        tracing::debug!(worker = %id, nodes, "worker acquired");
        Ok(handle)
    }

    async fn release(&self, worker: WorkerHandle) {
        if self.leases.remove(&worker.id).is_none() {
            tracing::warn!(worker = %worker.id, "release of unknown worker");
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Everything a resolved executable gets to see.
pub struct ExecutionContext {
    pub credentials: Option<Credentials>,
    pub nodes: Vec<NodeHandle>,
    pub run_as_user: bool,
    /// Cancelled when the attempt times out or is killed.
    pub interrupt: CancellationToken,
}

/// A live executable produced on the worker.
pub trait Executable: Send + Sync {
    fn execute(&self, ctx: ExecutionContext) -> BoxFuture<'_, Result<TaskOutput, ExecutionFailure>>;
}

/// Turns an [`ExecutableDescription`] of one kind into an [`Executable`].
pub trait ExecutableResolver: Send + Sync {
    /// Value of `ExecutableDescription::kind` this resolver handles.
    fn kind(&self) -> &str;

    fn resolve(&self, description: &ExecutableDescription) -> Result<Box<dyn Executable>, ExecutionFailure>;
}

/// Ships a container to a worker and awaits its result.
pub trait WorkerDispatch: Send + Sync + 'static {
    fn dispatch(
        &self,
        container: ExecutableContainer,
        worker: WorkerHandle,
        interrupt: CancellationToken,
    ) -> impl Future<Output = Result<TaskOutput, ExecutionFailure>> + Send;
}

/// Dispatch that runs containers in this process.
#[derive(Default, Clone)]
pub struct LocalDispatch {
    resolvers: HashMap<String, Arc<dyn ExecutableResolver>>,
}

impl LocalDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resolver(mut self, resolver: impl ExecutableResolver + 'static) -> Self {
        self.register(Arc::new(resolver));
        self
    }

    /// Register `resolver`, replacing any previous one for the same kind.
    pub fn register(&mut self, resolver: Arc<dyn ExecutableResolver>) {
        self.resolvers.insert(resolver.kind().to_string(), resolver);
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.resolvers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl std::fmt::Debug for LocalDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDispatch")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl WorkerDispatch for LocalDispatch {
    async fn dispatch(
        &self,
        container: ExecutableContainer,
        worker: WorkerHandle,
        interrupt: CancellationToken,
    ) -> Result<TaskOutput, ExecutionFailure> {
        let kind = container.description.kind.as_str();
        let resolver = self.resolvers.get(kind).ok_or_else(|| {
            ExecutionFailure::new(format!("no resolver for executable kind '{kind}'"))
        })?;
        let executable = resolver.resolve(&container.description)?;

        tracing::debug!(worker = %worker.id, kind, nodes = container.nodes.len(), "executing");
        executable
            .execute(ExecutionContext {
                credentials: container.credentials,
                nodes: container.nodes,
                run_as_user: container.run_as_user,
                interrupt,
            })
            .await
    }
}
