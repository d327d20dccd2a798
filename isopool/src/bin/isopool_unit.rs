//! Stock unit process: serves the built-in handlers over stdin/stdout.
//!
//! Hosts that need their own handlers build a binary like this one around
//! [`isopool::run_unit`] with their own [`HandlerRegistry`].

use std::time::Duration;

use anyhow::Context;
use isopool::{HandlerFailure, HandlerRegistry, Value};

fn builtin_handlers() -> HandlerRegistry {
    HandlerRegistry::new()
        .register("echo", |payload: Value| Ok(payload))
        // {"ms": n, "value": v}: block for n milliseconds, then return v.
        .register("sleep", |payload: Value| {
            let ms = payload.get("ms").and_then(Value::as_u64).unwrap_or(0);
            std::thread::sleep(Duration::from_millis(ms));
            Ok(payload.get("value").cloned().unwrap_or(Value::Null))
        })
        // {"name": n, "message": m}: fail with that error.
        .register("fail", |payload: Value| {
            let name = payload.get("name").and_then(Value::as_str).unwrap_or("Error");
            let message = payload.get("message").and_then(Value::as_str).unwrap_or("");
            Err(HandlerFailure::named(name, message))
        })
        // Array of numbers: their sum.
        .register("sum", |payload: Value| {
            let items = payload
                .as_array()
                .ok_or_else(|| HandlerFailure::named("TypeError", "expected an array"))?;
            let total: f64 = items.iter().filter_map(Value::as_f64).sum();
            Ok(Value::from(total))
        })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    isopool::logging::init_tracing();
    tracing::debug!(
        unit = std::env::var(isopool::unit::UNIT_ID_ENV).ok(),
        "Starting unit process"
    );
    isopool::run_unit(builtin_handlers())
        .await
        .context("unit loop failed")
}
