//! Scheduling engine for batchloom.
//!
//! This crate holds the job graph logic, the flow resolver, the task state
//! machine, the unit-of-work runner and the scheduler itself, plus the
//! storage and execution "ports" (traits) that `batchloom-infra` implements.
//! It depends on no database or process crate.

pub mod event;
pub mod execution;
pub mod flow;
pub mod graph;
pub mod repository;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod unit_of_work;

pub use scheduler::Scheduler;
pub use unit_of_work::UnitOfWorkRunner;
