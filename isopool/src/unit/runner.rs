//! Unit-side message handling, shared by thread and process units.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{stdin, stdout};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{TaskId, UnitId, UnitRequest, UnitResponse};
use crate::handler::{HandlerRegistry, TaskHandler};
use crate::serializer::{Transport, deserialize, extract_transferables, serialize, serialize_with_transfer};

/// State of one unit: the handler it was initialized with.
pub struct UnitRuntime {
    registry: Arc<HandlerRegistry>,
    unit: Option<UnitId>,
    handler: Option<Arc<dyn TaskHandler>>,
    supports_transfer: bool,
}

impl UnitRuntime {
    pub fn new(registry: Arc<HandlerRegistry>, supports_transfer: bool) -> Self {
        Self {
            registry,
            unit: None,
            handler: None,
            supports_transfer,
        }
    }

    pub fn unit(&self) -> Option<UnitId> {
        self.unit
    }

    /// Handle one request. `Err` is fatal: the unit must stop.
    pub fn handle_request(&mut self, request: UnitRequest) -> Result<UnitResponse, String> {
        match request {
            UnitRequest::Init { unit, handler } => {
                if self.handler.is_some() {
                    tracing::warn!(%unit, "Unit initialized twice, replacing handler");
                }
                let resolved = self.registry.resolve(&handler)?;
                self.handler = Some(resolved);
                self.unit = Some(unit);
                tracing::debug!(%unit, %handler, "Unit initialized");
                Ok(UnitResponse::Ready { id: unit })
            }
            UnitRequest::Task {
                id,
                payload,
                transfer,
            } => Ok(self.run_task(
                id,
                Transport {
                    data: payload,
                    transfer,
                },
            )),
        }
    }

    fn run_task(&self, id: TaskId, transport: Transport) -> UnitResponse {
        let Some(handler) = &self.handler else {
            return UnitResponse::Error {
                id,
                name: Some("UnitError".to_string()),
                message: "task received before init".to_string(),
            };
        };

        let payload = match deserialize(transport) {
            Ok(v) => v,
            Err(e) => {
                return UnitResponse::Error {
                    id,
                    name: Some("SerializeError".to_string()),
                    message: e.to_string(),
                };
            }
        };

        tracing::trace!(task = %id, "Running handler");
        match handler.handle(payload) {
            Ok(value) => {
                let encoded = if self.supports_transfer {
                    let transfer = extract_transferables(&value);
                    serialize_with_transfer(&value, &transfer)
                } else {
                    serialize(&value)
                };
                UnitResponse::Result {
                    id,
                    payload: encoded.data,
                    transfer: encoded.transfer,
                }
            }
            Err(failure) => {
                tracing::debug!(task = %id, error = %failure, "Handler failed");
                UnitResponse::Error {
                    id,
                    name: Some(failure.name),
                    message: failure.message,
                }
            }
        }
    }
}

/// Serve a process unit over stdin/stdout until the pool closes the pipe.
///
/// Stdout carries frames only; log to stderr.
pub async fn run_unit(registry: HandlerRegistry) -> std::io::Result<()> {
    let mut reader = FramedRead::new(stdin(), JsonCodec::<UnitRequest>::new());
    let mut writer = FramedWrite::new(stdout(), JsonCodec::<UnitResponse>::new());
    let mut runtime = UnitRuntime::new(Arc::new(registry), false);

    tracing::info!("Unit waiting for init");
    while let Some(frame) = reader.next().await {
        let request = frame?;
        // Handlers block; keep them off the reactor.
        let (returned, result) = tokio::task::spawn_blocking(move || {
            let result = runtime.handle_request(request);
            (runtime, result)
        })
        .await
        .map_err(std::io::Error::other)?;
        runtime = returned;

        match result {
            Ok(response) => writer.send(response).await?,
            Err(reason) => {
                tracing::error!(%reason, "Unit cannot start");
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    reason,
                ));
            }
        }
    }

    tracing::info!(unit = ?runtime.unit(), "Control channel closed, unit exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::HandlerRef;
    use crate::handler::HandlerFailure;
    use crate::value::{NumericArray, Value};
    use serde_json::json;
    use tokio_util::bytes::Bytes;

    fn registry() -> Arc<HandlerRegistry> {
        Arc::new(
            HandlerRegistry::new()
                .register("echo", |v: Value| Ok(v))
                .register("fail", |_: Value| {
                    Err(HandlerFailure::named("RangeError", "out of range"))
                })
                .register("wrap", |v: Value| {
                    let n = v.as_i64().unwrap_or(0) as i32;
                    Ok(Value::from(NumericArray::from_i32(&[n, n])))
                }),
        )
    }

    fn init(runtime: &mut UnitRuntime, name: &str) -> UnitId {
        let unit = UnitId::new();
        let resp = runtime
            .handle_request(UnitRequest::Init {
                unit,
                handler: HandlerRef::named(name),
            })
            .unwrap();
        assert_eq!(resp, UnitResponse::Ready { id: unit });
        unit
    }

    fn task(id: u64, payload: serde_json::Value) -> UnitRequest {
        UnitRequest::Task {
            id: TaskId::new(id),
            payload,
            transfer: vec![],
        }
    }

    #[test]
    fn echo_returns_payload() {
        let mut runtime = UnitRuntime::new(registry(), false);
        let unit = init(&mut runtime, "echo");
        assert_eq!(runtime.unit(), Some(unit));

        let resp = runtime.handle_request(task(1, json!({"a": 1}))).unwrap();
        assert_eq!(
            resp,
            UnitResponse::Result {
                id: TaskId::new(1),
                payload: json!({"a": 1}),
                transfer: vec![]
            }
        );
    }

    #[test]
    fn handler_errors_are_reported_not_fatal() {
        let mut runtime = UnitRuntime::new(registry(), false);
        init(&mut runtime, "fail");
        let resp = runtime.handle_request(task(2, json!(null))).unwrap();
        assert_eq!(
            resp,
            UnitResponse::Error {
                id: TaskId::new(2),
                name: Some("RangeError".into()),
                message: "out of range".into()
            }
        );
    }

    #[test]
    fn unknown_handler_is_fatal() {
        let mut runtime = UnitRuntime::new(registry(), false);
        let err = runtime
            .handle_request(UnitRequest::Init {
                unit: UnitId::new(),
                handler: HandlerRef::named("nope"),
            })
            .unwrap_err();
        assert!(err.contains("nope"));
    }

    #[test]
    fn task_before_init_is_an_error_response() {
        let mut runtime = UnitRuntime::new(registry(), false);
        let resp = runtime.handle_request(task(3, json!(1))).unwrap();
        assert!(matches!(resp, UnitResponse::Error { name: Some(n), .. } if n == "UnitError"));
    }

    #[test]
    fn results_transfer_buffers_in_process() {
        let mut runtime = UnitRuntime::new(registry(), true);
        init(&mut runtime, "wrap");
        let resp = runtime.handle_request(task(4, json!(5))).unwrap();
        let UnitResponse::Result { payload, transfer, .. } = resp else {
            panic!("expected result");
        };
        assert_eq!(payload["transfer"], json!(0));
        assert_eq!(transfer.len(), 1);
        assert_eq!(transfer[0], Bytes::from(vec![5, 0, 0, 0, 5, 0, 0, 0]));
    }

    #[test]
    fn results_are_inlined_across_processes() {
        let mut runtime = UnitRuntime::new(registry(), false);
        init(&mut runtime, "wrap");
        let resp = runtime.handle_request(task(5, json!(5))).unwrap();
        let UnitResponse::Result { payload, transfer, .. } = resp else {
            panic!("expected result");
        };
        assert_eq!(payload["values"], json!([5, 5]));
        assert!(transfer.is_empty());
    }
}
