//! Execution units: where handlers actually run.
//!
//! A unit is reached through a [`UnitLink`]: an outbound request channel, an
//! inbound response channel and a handle for forced termination. The pool
//! only ever talks to links, so thread units, process units and test doubles
//! are interchangeable behind [`UnitSpawner`].
//!
//! A closed response channel means the unit is gone.

mod process;
mod runner;
mod thread;

pub use process::{ProcessSpawner, UNIT_ID_ENV};
pub use runner::{UnitRuntime, run_unit};
pub use thread::ThreadSpawner;

use tokio::sync::mpsc;

use crate::bridge::protocol::{UnitId, UnitRequest, UnitResponse};

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn unit: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Forced shutdown and post-mortem for one unit.
pub trait UnitHandle: Send {
    /// Stop the unit without waiting for it. Must be idempotent.
    fn terminate(&mut self);

    /// Why the unit stopped, if it has stopped and that is knowable.
    fn exit_reason(&mut self) -> Option<String> {
        None
    }
}

pub struct UnitLink {
    pub requests: mpsc::UnboundedSender<UnitRequest>,
    pub responses: mpsc::UnboundedReceiver<UnitResponse>,
    pub handle: Box<dyn UnitHandle>,
    /// Whether buffers can be handed over by reference. Only true when the
    /// unit shares this address space.
    pub supports_transfer: bool,
}

/// Extension point for different unit spawn strategies.
pub trait UnitSpawner: Send + Sync {
    fn spawn(&self, unit: UnitId) -> Result<UnitLink, SpawnError>;
}
