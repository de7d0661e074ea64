//! Storage backends that live inside the core crate.

pub mod memory;

pub use memory::{MemoryBackend, MemorySession, MemoryStats};
