//! Units backed by dedicated OS threads.
//!
//! Cheapest isolation: separate stack and scheduling, shared address space.
//! Buffers move between pool and unit without copying.

use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::mpsc;

use super::{SpawnError, UnitHandle, UnitLink, UnitRuntime, UnitSpawner};
use crate::bridge::protocol::{UnitId, UnitRequest, UnitResponse};
use crate::handler::HandlerRegistry;

pub struct ThreadSpawner {
    registry: Arc<HandlerRegistry>,
}

impl ThreadSpawner {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }
}

impl UnitSpawner for ThreadSpawner {
    fn spawn(&self, unit: UnitId) -> Result<UnitLink, SpawnError> {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        let runtime = UnitRuntime::new(Arc::clone(&self.registry), true);

        let short = unit.to_string();
        let name = format!("isopool-unit-{}", &short[..8]);
        let join = std::thread::Builder::new()
            .name(name)
            .spawn(move || serve(runtime, req_rx, resp_tx))?;

        Ok(UnitLink {
            requests: req_tx,
            responses: resp_rx,
            handle: Box::new(ThreadUnit { join: Some(join) }),
            supports_transfer: true,
        })
    }
}

fn serve(
    mut runtime: UnitRuntime,
    mut requests: mpsc::UnboundedReceiver<UnitRequest>,
    responses: mpsc::UnboundedSender<UnitResponse>,
) -> Result<(), String> {
    while let Some(request) = requests.blocking_recv() {
        let response = runtime.handle_request(request)?;
        if responses.send(response).is_err() {
            break;
        }
    }
    Ok(())
}

struct ThreadUnit {
    join: Option<JoinHandle<Result<(), String>>>,
}

impl UnitHandle for ThreadUnit {
    // The thread exits once the pool drops its request sender. A handler
    // that never returns cannot be interrupted; the thread is detached.
    fn terminate(&mut self) {
        self.join.take();
    }

    // Only asked once the response channel has closed, which happens as the
    // thread returns or unwinds, so the join is short.
    fn exit_reason(&mut self) -> Option<String> {
        match self.join.take()?.join() {
            Ok(Ok(())) => None,
            Ok(Err(reason)) => Some(reason),
            Err(panic) => Some(panic_message(panic.as_ref())),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("unit panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("unit panicked: {s}")
    } else {
        "unit panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{HandlerRef, TaskId};
    use crate::value::Value;
    use serde_json::json;

    fn spawner() -> ThreadSpawner {
        ThreadSpawner::new(
            HandlerRegistry::new()
                .register("echo", |v: Value| Ok(v))
                .register("explode", |_: Value| -> Result<Value, crate::handler::HandlerFailure> {
                    panic!("kaboom")
                }),
        )
    }

    #[tokio::test]
    async fn init_then_task() {
        let unit = UnitId::new();
        let mut link = spawner().spawn(unit).unwrap();
        assert!(link.supports_transfer);

        link.requests
            .send(UnitRequest::Init {
                unit,
                handler: HandlerRef::named("echo"),
            })
            .unwrap();
        assert_eq!(
            link.responses.recv().await,
            Some(UnitResponse::Ready { id: unit })
        );

        link.requests
            .send(UnitRequest::Task {
                id: TaskId::new(1),
                payload: json!("hi"),
                transfer: vec![],
            })
            .unwrap();
        let resp = link.responses.recv().await.unwrap();
        assert_eq!(resp.task_id(), Some(TaskId::new(1)));

        drop(link.requests);
        assert!(link.responses.recv().await.is_none());
    }

    #[tokio::test]
    async fn panic_closes_channel_and_reports_reason() {
        let unit = UnitId::new();
        let mut link = spawner().spawn(unit).unwrap();
        link.requests
            .send(UnitRequest::Init {
                unit,
                handler: HandlerRef::named("explode"),
            })
            .unwrap();
        link.responses.recv().await.unwrap();
        link.requests
            .send(UnitRequest::Task {
                id: TaskId::new(1),
                payload: json!(null),
                transfer: vec![],
            })
            .unwrap();
        assert!(link.responses.recv().await.is_none());
        assert_eq!(
            link.handle.exit_reason().as_deref(),
            Some("unit panicked: kaboom")
        );
        assert_eq!(link.handle.exit_reason(), None);
    }

    #[tokio::test]
    async fn unknown_handler_stops_the_unit() {
        let unit = UnitId::new();
        let mut link = spawner().spawn(unit).unwrap();
        link.requests
            .send(UnitRequest::Init {
                unit,
                handler: HandlerRef::named("missing"),
            })
            .unwrap();
        assert!(link.responses.recv().await.is_none());
        assert_eq!(
            link.handle.exit_reason().as_deref(),
            Some("no handler registered as \"missing\"")
        );
    }
}
