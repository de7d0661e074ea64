//! Storage port traits.
//!
//! The scheduler only talks to storage through a [`TransactionalBackend`]:
//! it opens a session, runs a unit of work against it through the
//! [`JobSession`] operations, and commits or rolls back. The infrastructure
//! layer (batchloom-infra) implements these with SQLite; the in-memory
//! backend in [`crate::store`] serves tests and embedded use.

pub mod job;

pub use job::JobSession;

use std::future::Future;

use batchloom_types::error::StoreError;

/// Whether a session may write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// Source of transactional sessions.
///
/// Each call to [`begin`](Self::begin) yields an independent session; a
/// session is never shared between concurrent attempts. Dropping a session
/// without committing must release it and discard its writes.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait TransactionalBackend: Send + Sync + 'static {
    type Session: JobSession;

    fn begin(
        &self,
        mode: AccessMode,
    ) -> impl Future<Output = Result<Self::Session, StoreError>> + Send;

    fn commit(&self, session: Self::Session) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn rollback(&self, session: Self::Session)
    -> impl Future<Output = Result<(), StoreError>> + Send;
}
