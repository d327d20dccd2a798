//! Wire protocol between a pool and its execution units.
//!
//! Every unit sees the same sequence: one `Init`, answered by `Ready`, then any
//! number of `Task` messages, each answered by exactly one `Result` or `Error`.
//! Payloads are tagged JSON produced by [`crate::serializer`]. Transfer lists
//! only exist in-process and are never written to a stream.

use serde::{Deserialize, Serialize};
use tokio_util::bytes::Bytes;

/// Unique identifier for an execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(uuid::Uuid);

impl UnitId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for UnitId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pool-unique task identifier, allocated in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    pub fn new(n: u64) -> Self {
        Self(n)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which handler a unit should run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum HandlerRef {
    /// A handler registered under this name in the unit's registry.
    Named(String),
    /// Handler source text. Checked by the closure lint before any unit starts.
    Inline(String),
}

impl HandlerRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    pub fn inline(source: impl Into<String>) -> Self {
        Self::Inline(source.into())
    }
}

impl std::fmt::Display for HandlerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Named(name) => write!(f, "{name}"),
            Self::Inline(_) => write!(f, "<inline>"),
        }
    }
}

/// Messages from pool to unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitRequest {
    /// First message after spawn.
    Init { unit: UnitId, handler: HandlerRef },

    Task {
        id: TaskId,
        payload: serde_json::Value,
        /// Buffers referenced by index from `payload`. In-process only.
        #[serde(skip)]
        transfer: Vec<Bytes>,
    },
}

/// Messages from unit to pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitResponse {
    Ready {
        id: UnitId,
    },

    Result {
        id: TaskId,
        payload: serde_json::Value,
        #[serde(skip)]
        transfer: Vec<Bytes>,
    },

    /// The handler failed. Name and message are passed through verbatim.
    Error {
        id: TaskId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        message: String,
    },
}

impl UnitResponse {
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::Ready { .. } => None,
            Self::Result { id, .. } | Self::Error { id, .. } => Some(*id),
        }
    }
}
