//! Runtime graph rewriting driven by flow directives.
//!
//! - `resolver` -- LOOP and REPLICATE resolution into an explicit `GraphDelta`
//! - `apply` -- idempotent materialization of a delta into task records

pub mod apply;
pub mod resolver;

pub use apply::{apply_delta, apply_records, materialize};
pub use resolver::FlowResolver;
