//! End-to-end tests against the `isopool-unit` binary.
//!
//! Each pool here runs its units as child processes speaking the framed
//! protocol over stdio.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use isopool::bridge::protocol::UnitRequest;
use isopool::{
    ErrorValue, ExecOptions, HandlerFailure, HandlerRef, MapOptions, NumericArray, Pool,
    PoolConfig, PoolError, ProcessSpawner, UnitId, UnitSpawner, Value,
};

fn unit_binary() -> ProcessSpawner {
    ProcessSpawner::new(env!("CARGO_BIN_EXE_isopool-unit")).with_env("ISOPOOL_LOG", "warn")
}

fn process_pool(handler: &str) -> PoolConfig {
    PoolConfig::new(HandlerRef::named(handler))
        .with_spawner(Arc::new(unit_binary()))
        .with_min_units(1)
        .with_max_units(2)
}

#[tokio::test]
async fn rich_values_survive_the_process_boundary() {
    let pool = Pool::new(process_pool("echo")).unwrap();

    let samples = NumericArray::from_i64(&[i64::MIN, -1, 0, i64::MAX]);
    let payload = Value::object([
        (
            "when",
            Value::from(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
        ),
        (
            "tags",
            Value::Set(vec![Value::from("a"), Value::from("b")]),
        ),
        (
            "lookup",
            Value::Map(vec![(Value::from(1), Value::from("one"))]),
        ),
        (
            "pattern",
            Value::RegExp {
                source: "^a+$".to_string(),
                flags: "gi".to_string(),
            },
        ),
        (
            "last_error",
            Value::from(ErrorValue::new("TypeError", "bad input")),
        ),
        ("samples", Value::from(samples.clone())),
    ]);

    // Transfer lists are honoured in-process only; a child gets a copy.
    let out = pool
        .exec(
            payload.clone(),
            ExecOptions::new().with_transfer(vec![samples.buffer().clone()]),
        )
        .await
        .unwrap();
    assert_eq!(out, payload);
}

#[tokio::test]
async fn handler_errors_cross_verbatim() {
    let pool = Pool::new(process_pool("fail")).unwrap();
    let payload = Value::object([
        ("name", Value::from("RangeError")),
        ("message", Value::from("index 9 out of bounds")),
    ]);
    let err = pool.exec(payload, ExecOptions::new()).await.unwrap_err();
    assert_eq!(
        err,
        PoolError::Handler(HandlerFailure::named("RangeError", "index 9 out of bounds"))
    );
    assert_eq!(pool.metrics().failed_tasks, 1);
}

#[tokio::test]
async fn slow_task_times_out_and_unit_keeps_serving() {
    let pool = Pool::new(
        process_pool("sleep")
            .with_max_units(1)
            .with_task_timeout(Duration::from_millis(200)),
    )
    .unwrap();

    let slow = Value::object([("ms", Value::from(800)), ("value", Value::from("late"))]);
    let err = pool.exec(slow, ExecOptions::new()).await.unwrap_err();
    assert_eq!(err, PoolError::TaskTimeout(Duration::from_millis(200)));

    // Queued behind the abandoned task inside the child; the late result is dropped.
    let quick = Value::object([("ms", Value::from(0)), ("value", Value::from("after"))]);
    let out = pool
        .exec(quick, ExecOptions::new().with_timeout(Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(out, Value::from("after"));
}

#[tokio::test]
async fn map_spreads_over_processes() {
    let pool = Pool::new(process_pool("sum")).unwrap();
    let batches: Vec<Value> = (1..=6)
        .map(|n: i64| Value::from((1..=n).map(Value::from).collect::<Vec<_>>()))
        .collect();
    let totals = pool.map(batches, MapOptions::new()).await.unwrap();
    let expected: Vec<Value> = [1.0, 3.0, 6.0, 10.0, 15.0, 21.0]
        .into_iter()
        .map(Value::from)
        .collect();
    assert_eq!(totals, expected);
    assert!(pool.metrics().total_units <= 2);
}

#[tokio::test]
async fn unknown_handler_is_a_unit_fault() {
    let pool = Pool::new(process_pool("nope").with_max_units(1)).unwrap();
    let err = pool.exec(Value::Null, ExecOptions::new()).await.unwrap_err();
    assert!(matches!(err, PoolError::UnitFault(_)), "{err:?}");
}

#[tokio::test]
async fn exit_status_is_the_fault_reason() {
    let unit = UnitId::new();
    let mut link = unit_binary().spawn(unit).unwrap();
    link.requests
        .send(UnitRequest::Init {
            unit,
            handler: HandlerRef::named("nope"),
        })
        .unwrap();

    // The unit refuses to start; its output closes once it has been reaped.
    assert!(link.responses.recv().await.is_none());
    let reason = link.handle.exit_reason().expect("exit status recorded");
    assert!(reason.starts_with("unit process exited"), "{reason}");
    assert!(reason.contains('1'), "{reason}");
}

#[tokio::test]
async fn terminate_kills_a_busy_process() {
    let unit = UnitId::new();
    let mut link = unit_binary().spawn(unit).unwrap();
    link.requests
        .send(UnitRequest::Init {
            unit,
            handler: HandlerRef::named("sleep"),
        })
        .unwrap();
    assert!(link.responses.recv().await.is_some());

    link.requests
        .send(UnitRequest::Task {
            id: isopool::TaskId::new(1),
            payload: serde_json::json!({"ms": 60_000}),
            transfer: vec![],
        })
        .unwrap();
    link.handle.terminate();

    let closed = tokio::time::timeout(Duration::from_secs(10), link.responses.recv()).await;
    assert!(matches!(closed, Ok(None)));
    assert!(link.handle.exit_reason().is_some());
}
