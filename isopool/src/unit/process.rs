//! Units backed by child processes speaking framed JSON over stdin/stdout.
//!
//! Strongest isolation: a crash, leak or runaway handler takes down only the
//! child. Nothing is shared, so buffers are always inlined.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::{SpawnError, UnitHandle, UnitLink, UnitSpawner};
use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{UnitId, UnitRequest, UnitResponse};

/// Env var carrying the unit id into the child, for its logs.
pub const UNIT_ID_ENV: &str = "ISOPOOL_UNIT_ID";

/// How long the reader waits, after stdout closes, for the child to be reaped
/// so the exit status is known when the pool asks for it.
const REAP_GRACE: Duration = Duration::from_millis(500);

/// Spawns a program that serves [`super::run_unit`] on its stdio.
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl UnitSpawner for ProcessSpawner {
    fn spawn(&self, unit: UnitId) -> Result<UnitLink, SpawnError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env(UNIT_ID_ENV, unit.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;

        tracing::debug!(%unit, pid = ?child.id(), program = %self.program.display(), "Spawned unit process");

        let (req_tx, mut req_rx) = mpsc::unbounded_channel::<UnitRequest>();
        let (resp_tx, resp_rx) = mpsc::unbounded_channel::<UnitResponse>();

        let mut writer = FramedWrite::new(stdin, JsonCodec::<UnitRequest>::new());
        tokio::spawn(async move {
            while let Some(request) = req_rx.recv().await {
                if let Err(e) = writer.send(request).await {
                    tracing::warn!(%unit, error = %e, "Failed to write to unit");
                    break;
                }
            }
            tracing::trace!(%unit, "Unit writer exiting");
        });

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(wait_for_exit(unit, child, kill_rx, exit_tx));

        let mut reader = FramedRead::new(stdout, JsonCodec::<UnitResponse>::new());
        let mut reaped = exit_rx.clone();
        tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(response) => {
                        if resp_tx.send(response).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(%unit, error = %e, "Unit sent an unreadable frame");
                        break;
                    }
                }
            }
            // Closing the response channel reports the fault; give the
            // child a moment to be reaped first.
            let reaped_in_time = tokio::time::timeout(REAP_GRACE, reaped.wait_for(Option::is_some))
                .await
                .is_ok_and(|r| r.is_ok());
            if !reaped_in_time {
                tracing::debug!(%unit, "Unit output closed but process not yet reaped");
            }
            tracing::trace!(%unit, "Unit reader exiting");
        });

        Ok(UnitLink {
            requests: req_tx,
            responses: resp_rx,
            handle: Box::new(ProcessUnit {
                kill: Some(kill_tx),
                exit: exit_rx,
            }),
            supports_transfer: false,
        })
    }
}

/// Owns the child: reaps it, or kills it once asked (or once the handle is dropped).
async fn wait_for_exit(
    unit: UnitId,
    mut child: Child,
    kill: oneshot::Receiver<()>,
    exit: watch::Sender<Option<ExitStatus>>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill => None,
    };
    let status = match exited {
        Some(status) => status,
        None => {
            if let Err(e) = child.start_kill() {
                tracing::trace!(%unit, error = %e, "Unit process already gone");
            }
            child.wait().await
        }
    };
    match status {
        Ok(status) => {
            tracing::debug!(%unit, %status, "Unit process exited");
            let _ = exit.send(Some(status));
        }
        Err(e) => tracing::warn!(%unit, error = %e, "Failed to reap unit process"),
    }
}

struct ProcessUnit {
    kill: Option<oneshot::Sender<()>>,
    exit: watch::Receiver<Option<ExitStatus>>,
}

impl UnitHandle for ProcessUnit {
    fn terminate(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }

    fn exit_reason(&mut self) -> Option<String> {
        let status = (*self.exit.borrow())?;
        Some(format!("unit process exited: {status}"))
    }
}
