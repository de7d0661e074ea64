//! Event bus for scheduler status changes.
//!
//! Provides an `EventBus` that distributes `SchedulerEvent` messages to all
//! subscribers via a `tokio::sync::broadcast` channel.

pub mod bus;

pub use bus::EventBus;
