//! Executable container and the types exchanged with workers.
//!
//! The scheduler only ships an [`ExecutableContainer`] to a worker and awaits
//! a [`TaskOutput`]. Turning the description into something runnable is the
//! worker's job.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::flow::FlowAction;

/// Serialized description of what a task runs.
///
/// `kind` selects the worker-side resolver (e.g. `"command"`), `spec` is
/// resolver-specific and never inspected by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutableDescription {
    pub kind: String,
    #[serde(default)]
    pub spec: serde_json::Value,
}

/// Opaque, already-encrypted credential blob forwarded to the worker.
///
/// Serialized as base64. `Debug` never prints the content.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Credentials(Vec<u8>);

impl Credentials {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credentials(<{} bytes>)", self.0.len())
    }
}

impl Serialize for Credentials {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Credentials {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

/// A node handed out by the resource allocator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHandle {
    pub name: String,
}

/// Everything a worker needs to run one task attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutableContainer {
    pub description: ExecutableDescription,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    /// Nodes allocated for this attempt; filled in right before dispatch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeHandle>,
    #[serde(default)]
    pub run_as_user: bool,
}

impl ExecutableContainer {
    pub fn new(description: ExecutableDescription) -> Self {
        Self {
            description,
            credentials: None,
            nodes: Vec::new(),
            run_as_user: false,
        }
    }

    /// Copy of the container bound to the given allocated nodes.
    pub fn with_nodes(&self, nodes: Vec<NodeHandle>) -> Self {
        Self {
            nodes,
            ..self.clone()
        }
    }
}

/// Capacity requested from the resource allocator for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub nodes: u32,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self { nodes: 1 }
    }
}

/// Lease on execution capacity returned by the allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub id: Uuid,
    pub nodes: Vec<NodeHandle>,
}

/// Successful result of an executable.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskOutput {
    #[serde(default)]
    pub value: serde_json::Value,
    /// Runtime flow decision; overrides the task's declared directive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<FlowAction>,
}

impl TaskOutput {
    pub fn value(value: serde_json::Value) -> Self {
        Self { value, flow: None }
    }
}
