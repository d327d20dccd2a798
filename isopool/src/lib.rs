//! isopool: a dynamically sized pool of isolated execution units.
//!
//! Callers submit serializable payloads; a fixed handler runs them on a unit
//! (a dedicated thread or a child process) and the result comes back through
//! the same serializer. The pool grows on demand up to `max_units`, reaps idle
//! units down to `min_units`, queues overflow by priority and applies
//! backpressure once the queue is full.
//!
//! ```no_run
//! # async fn demo() -> Result<(), isopool::PoolError> {
//! use isopool::{ExecOptions, HandlerRegistry, Pool, PoolConfig, Value};
//!
//! let handlers = HandlerRegistry::new().register("double", |v: Value| {
//!     Ok(Value::from(v.as_i64().unwrap_or(0) * 2))
//! });
//! let pool = Pool::new(PoolConfig::threads("double", handlers).with_max_units(4))?;
//! let out = pool.exec(Value::from(21), ExecOptions::new()).await?;
//! assert_eq!(out, Value::from(42));
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod handler;
pub mod logging;
pub mod pool;
pub mod registry;
pub mod scheduler;
pub mod serializer;
pub mod unit;
pub mod value;

pub use bridge::protocol::{HandlerRef, TaskId, UnitId};
pub use handler::{HandlerFailure, HandlerRegistry, TaskHandler};
pub use pool::{
    BackpressureStrategy, ExecOptions, MapOptions, Pool, PoolConfig, PoolError, PoolMetrics,
    PressureEvent,
};
pub use registry::PoolRegistry;
pub use scheduler::SchedulingPolicy;
pub use serializer::{SerializeError, Transport, deserialize, serialize};
pub use unit::{ProcessSpawner, SpawnError, ThreadSpawner, UnitSpawner, run_unit};
pub use value::{ErrorValue, NumericArray, NumericKind, SharedValue, Value};
