//! Pool controller: owns the units, the wait queue and in-flight bookkeeping.
//!
//! All state lives behind one mutex. Unit readers, task timers and the idle
//! reaper are tokio tasks holding a `Weak` to the pool core, so dropping the
//! last [`Pool`] tears everything down. User callbacks and oneshot receivers
//! run outside the lock.
//!
//! Task lifecycle:
//!
//! ```text
//! exec ──► idle unit? ──yes──► dispatch ──► pending ──► Result/Error ──► caller
//!            │ no                              │ timer fires ──► TaskTimeout
//!            ▼                                 │ unit dies   ──► UnitFault
//!        spawn budget? ──yes──► dispatch       ▼
//!            │ no                          unit idle ──► drain queue
//!            ▼
//!        queue (or reject / wait on backpressure)
//! ```

mod config;
mod error;

pub use config::{
    BackpressureStrategy, ENV_BACKPRESSURE, ENV_BACKPRESSURE_TIMEOUT_MS, ENV_IDLE_TIMEOUT_MS,
    ENV_MAX_QUEUE_SIZE, ENV_MAX_UNITS, ENV_MIN_UNITS, ENV_TASK_TIMEOUT_MS, PoolConfig,
    PressureCallback, PressureEvent,
};
pub use error::PoolError;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::bytes::Bytes;

use crate::bridge::protocol::{TaskId, UnitId, UnitRequest, UnitResponse};
use crate::handler::HandlerFailure;
use crate::scheduler::{Prioritized, Scheduler};
use crate::serializer::{Transport, deserialize, serialize, serialize_with_transfer};
use crate::unit::{UnitHandle, UnitLink, UnitSpawner};
use crate::value::Value;

/// Per-call options for [`Pool::exec`].
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Overrides the pool's task timeout. Zero disables it.
    pub timeout: Option<Duration>,
    /// Buffers inside the payload to hand over without copying.
    pub transfer: Vec<Bytes>,
    /// Higher runs first when queued.
    pub priority: i32,
}

impl ExecOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_transfer(mut self, transfer: Vec<Bytes>) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Picks the transferable buffers for each mapped item.
pub type TransferFn = Arc<dyn Fn(&Value, usize) -> Vec<Bytes> + Send + Sync>;

/// Options for [`Pool::map`].
#[derive(Clone, Default)]
pub struct MapOptions {
    pub timeout: Option<Duration>,
    pub priority: i32,
    /// Concurrent submissions. Defaults to the pool's `max_units`.
    pub concurrency: Option<usize>,
    pub transfer: Option<TransferFn>,
}

impl fmt::Debug for MapOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapOptions")
            .field("timeout", &self.timeout)
            .field("priority", &self.priority)
            .field("concurrency", &self.concurrency)
            .field("transfer", &self.transfer.is_some())
            .finish()
    }
}

impl MapOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = Some(n);
        self
    }

    pub fn with_transfer(mut self, f: impl Fn(&Value, usize) -> Vec<Bytes> + Send + Sync + 'static) -> Self {
        self.transfer = Some(Arc::new(f));
        self
    }
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolMetrics {
    pub total_units: usize,
    pub idle_units: usize,
    pub busy_units: usize,
    /// In flight plus queued.
    pub pending_tasks: usize,
    pub queued_tasks: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub avg_task_duration: Duration,
}

type Reply = oneshot::Sender<Result<Value, PoolError>>;

/// Consecutive pre-`Ready` unit losses after which the pool stops refilling
/// to `min_units`. Any unit reaching `Ready` resets the count.
const MAX_STARTUP_FAILURES: u32 = 3;

struct QueuedTask {
    id: TaskId,
    priority: i32,
    enqueued_at: Instant,
    payload: Value,
    transfer: Vec<Bytes>,
    timeout: Option<Duration>,
    reply: Reply,
}

impl Prioritized for QueuedTask {
    fn priority(&self) -> i32 {
        self.priority
    }
}

struct PendingTask {
    unit: UnitId,
    reply: Reply,
    started: Instant,
    timeout: Duration,
    timer: Option<JoinHandle<()>>,
}

impl PendingTask {
    fn cancel_timer(&self) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
    }
}

struct UnitEntry {
    id: UnitId,
    requests: mpsc::UnboundedSender<UnitRequest>,
    handle: Box<dyn UnitHandle>,
    supports_transfer: bool,
    task: Option<TaskId>,
    last_used: Instant,
    ready: bool,
}

impl UnitEntry {
    fn is_idle(&self) -> bool {
        self.task.is_none()
    }
}

#[derive(Default)]
struct Stats {
    completed: u64,
    failed: u64,
    timed: u64,
    busy_time: Duration,
}

impl Stats {
    fn average(&self) -> Duration {
        if self.timed == 0 {
            return Duration::ZERO;
        }
        let nanos = self.busy_time.as_nanos() / u128::from(self.timed);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

/// Smallest queue length at or above 80% of `max`, i.e. `ceil(max * 4 / 5)`.
fn pressure_threshold(max: usize) -> usize {
    max - max / 5
}

struct PoolState {
    terminated: bool,
    min_units: usize,
    max_units: usize,
    units: Vec<UnitEntry>,
    queue: Box<dyn Scheduler<QueuedTask>>,
    pending: HashMap<TaskId, PendingTask>,
    /// Submissions waiting for queue room. Dropping a sender wakes it with `Terminated`.
    waiters: VecDeque<oneshot::Sender<()>>,
    next_task_id: u64,
    stats: Stats,
    pressured: bool,
    reap_timer: Option<JoinHandle<()>>,
    /// Units lost before `Ready` since the last unit came up.
    startup_failures: u32,
}

impl PoolState {
    fn allocate_id(&mut self) -> TaskId {
        self.next_task_id += 1;
        TaskId::new(self.next_task_id)
    }

    fn unit_mut(&mut self, id: UnitId) -> Option<&mut UnitEntry> {
        self.units.iter_mut().find(|u| u.id == id)
    }

    fn release_unit(&mut self, id: UnitId) {
        if let Some(entry) = self.unit_mut(id) {
            entry.task = None;
            entry.last_used = Instant::now();
        }
    }

    /// Returns an event only on the rising edge.
    fn update_pressure(&mut self, max_queue_size: Option<usize>) -> Option<PressureEvent> {
        let max = max_queue_size.filter(|m| *m > 0)?;
        let size = self.queue.len();
        let high = size >= pressure_threshold(max);
        match (high, self.pressured) {
            (true, false) => {
                self.pressured = true;
                Some(PressureEvent {
                    queue_size: size,
                    max_queue_size: max,
                })
            }
            (false, true) => {
                self.pressured = false;
                tracing::debug!(queue_size = size, "Queue pressure relieved");
                None
            }
            _ => None,
        }
    }
}

enum Admission {
    Accepted,
    Full(QueuedTask, usize),
}

struct PoolInner {
    config: PoolConfig,
    spawner: Arc<dyn UnitSpawner>,
    runtime: Handle,
    state: StdMutex<PoolState>,
}

impl PoolInner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Pool state mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn record_finished(&self, state: &mut PoolState, ok: bool, elapsed: Option<Duration>) {
        if !self.config.track_metrics {
            return;
        }
        if ok {
            state.stats.completed += 1;
        } else {
            state.stats.failed += 1;
        }
        if let Some(elapsed) = elapsed {
            state.stats.timed += 1;
            state.stats.busy_time += elapsed;
        }
    }

    fn fire_pressure(&self, event: Option<PressureEvent>) {
        let Some(event) = event else { return };
        tracing::warn!(
            queue_size = event.queue_size,
            max_queue_size = event.max_queue_size,
            "Task queue under pressure"
        );
        if let Some(callback) = &self.config.on_pressure {
            callback(event);
        }
    }

    // -----------------------------------------------------------------------
    // Units
    // -----------------------------------------------------------------------

    fn spawn_unit(self: &Arc<Self>, state: &mut PoolState) -> Result<usize, PoolError> {
        let id = UnitId::new();
        let link = {
            let _enter = self.runtime.enter();
            self.spawner.spawn(id)?
        };
        let UnitLink {
            requests,
            responses,
            mut handle,
            supports_transfer,
        } = link;

        let init = UnitRequest::Init {
            unit: id,
            handler: self.config.handler.clone(),
        };
        if requests.send(init).is_err() {
            handle.terminate();
            return Err(PoolError::Spawn(format!("unit {id} closed before init")));
        }

        self.watch_unit(id, responses);
        state.units.push(UnitEntry {
            id,
            requests,
            handle,
            supports_transfer,
            task: None,
            last_used: Instant::now(),
            ready: false,
        });
        tracing::debug!(unit = %id, total = state.units.len(), "Spawned unit");
        Ok(state.units.len() - 1)
    }

    fn watch_unit(self: &Arc<Self>, unit: UnitId, mut responses: mpsc::UnboundedReceiver<UnitResponse>) {
        let weak = Arc::downgrade(self);
        self.runtime.spawn(async move {
            while let Some(response) = responses.recv().await {
                let Some(inner) = weak.upgrade() else { return };
                inner.on_response(unit, response);
            }
            if let Some(inner) = weak.upgrade() {
                inner.on_unit_exit(unit);
            }
        });
    }

    fn ensure_min_units(self: &Arc<Self>, state: &mut PoolState) -> Result<(), PoolError> {
        while state.units.len() < state.min_units {
            self.spawn_unit(state)?;
        }
        Ok(())
    }

    fn refill(self: &Arc<Self>, state: &mut PoolState) {
        if let Err(e) = self.ensure_min_units(state) {
            tracing::error!(error = %e, "Failed to replace unit");
        }
    }

    /// Least recently used idle unit, or a fresh one if the budget allows.
    ///
    /// Errors only when a spawn fails and there is no unit left to queue behind.
    fn acquire_unit(self: &Arc<Self>, state: &mut PoolState) -> Result<Option<usize>, PoolError> {
        let idle = state
            .units
            .iter()
            .enumerate()
            .filter(|(_, u)| u.is_idle())
            .min_by_key(|(_, u)| u.last_used)
            .map(|(i, _)| i);
        if idle.is_some() {
            return Ok(idle);
        }
        if state.units.len() >= state.max_units {
            return Ok(None);
        }
        match self.spawn_unit(state) {
            Ok(index) => Ok(Some(index)),
            Err(e) if state.units.is_empty() => Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to grow pool, queueing instead");
                Ok(None)
            }
        }
    }

    fn reap_idle(&self, state: &mut PoolState) {
        let timeout = self.config.idle_timeout;
        while state.units.len() > state.min_units {
            let candidate = state
                .units
                .iter()
                .enumerate()
                .filter(|(_, u)| u.is_idle() && u.last_used.elapsed() >= timeout)
                .min_by_key(|(_, u)| u.last_used)
                .map(|(i, _)| i);
            let Some(index) = candidate else { break };
            let mut entry = state.units.remove(index);
            entry.handle.terminate();
            tracing::debug!(
                unit = %entry.id,
                idle_ms = entry.last_used.elapsed().as_millis() as u64,
                remaining = state.units.len(),
                "Reaped idle unit"
            );
        }
    }

    fn schedule_reap(self: &Arc<Self>, state: &mut PoolState) {
        if state.terminated || state.units.len() <= state.min_units {
            return;
        }
        if let Some(timer) = state.reap_timer.take() {
            timer.abort();
        }
        let weak = Arc::downgrade(self);
        let delay = self.config.idle_timeout;
        state.reap_timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_reap_timer();
            }
        }));
    }

    fn on_reap_timer(self: &Arc<Self>) {
        let mut state = self.lock_state();
        // This is the running timer; forget it rather than abort it.
        state.reap_timer = None;
        if state.terminated {
            return;
        }
        self.reap_idle(&mut state);
        self.schedule_reap(&mut state);
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    fn admit(
        self: &Arc<Self>,
        state: &mut PoolState,
        task: QueuedTask,
        force: bool,
    ) -> Result<Admission, PoolError> {
        if let Some(index) = self.acquire_unit(state)? {
            self.dispatch(state, index, task);
            return Ok(Admission::Accepted);
        }
        let queued = state.queue.len();
        if !force && self.config.max_queue_size.is_some_and(|max| queued >= max) {
            return Ok(Admission::Full(task, queued));
        }
        tracing::trace!(task_id = %task.id, priority = task.priority, queued = queued + 1, "Task queued");
        state.queue.enqueue(task);
        Ok(Admission::Accepted)
    }

    fn dispatch(self: &Arc<Self>, state: &mut PoolState, index: usize, task: QueuedTask) {
        let QueuedTask {
            id,
            payload,
            transfer,
            timeout,
            reply,
            enqueued_at,
            ..
        } = task;

        let unit = &state.units[index];
        let encoded = if unit.supports_transfer {
            serialize_with_transfer(&payload, &transfer)
        } else {
            serialize(&payload)
        };
        let request = UnitRequest::Task {
            id,
            payload: encoded.data,
            transfer: encoded.transfer,
        };

        if unit.requests.send(request).is_err() {
            let mut entry = state.units.remove(index);
            entry.handle.terminate();
            tracing::warn!(unit = %entry.id, task_id = %id, "Unit link closed at dispatch");
            self.record_finished(state, false, None);
            let _ = reply.send(Err(PoolError::UnitFault(format!(
                "unit {} is no longer reachable",
                entry.id
            ))));
            self.refill(state);
            return;
        }

        let now = Instant::now();
        let unit = &mut state.units[index];
        unit.task = Some(id);
        unit.last_used = now;
        let unit_id = unit.id;

        let timeout = timeout.unwrap_or(self.config.task_timeout);
        let timer = self.arm_task_timer(id, timeout);
        state.pending.insert(
            id,
            PendingTask {
                unit: unit_id,
                reply,
                started: now,
                timeout,
                timer,
            },
        );
        tracing::debug!(
            task_id = %id,
            unit = %unit_id,
            waited_ms = now.duration_since(enqueued_at).as_millis() as u64,
            "Dispatched task"
        );
    }

    fn arm_task_timer(self: &Arc<Self>, id: TaskId, timeout: Duration) -> Option<JoinHandle<()>> {
        if timeout.is_zero() {
            return None;
        }
        let weak = Arc::downgrade(self);
        Some(self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_timeout(id);
            }
        }))
    }

    fn drain_queue(self: &Arc<Self>, state: &mut PoolState) {
        while !state.queue.is_empty() {
            match self.acquire_unit(state) {
                Ok(Some(index)) => {
                    let Some(task) = state.queue.dequeue() else { break };
                    self.dispatch(state, index, task);
                }
                Ok(None) => break,
                Err(e) => {
                    let stranded = state.queue.clear();
                    tracing::error!(error = %e, stranded = stranded.len(), "No units left, failing queued tasks");
                    for task in stranded {
                        self.record_finished(state, false, None);
                        let _ = task.reply.send(Err(e.clone()));
                    }
                    break;
                }
            }
        }
    }

    fn wake_waiters(&self, state: &mut PoolState) {
        if state.waiters.is_empty() {
            return;
        }
        let mut room = match self.config.max_queue_size {
            Some(max) => max.saturating_sub(state.queue.len()),
            None => state.waiters.len(),
        };
        if state.queue.is_empty() {
            room += state.units.iter().filter(|u| u.is_idle()).count();
            room += state.max_units.saturating_sub(state.units.len());
        }
        while room > 0 {
            let Some(waiter) = state.waiters.pop_front() else { break };
            if waiter.send(()).is_ok() {
                room -= 1;
            }
        }
    }

    /// Bookkeeping after any unit becomes free or the bounds change.
    fn settle(self: &Arc<Self>, state: &mut PoolState) -> Option<PressureEvent> {
        self.drain_queue(state);
        self.wake_waiters(state);
        self.schedule_reap(state);
        state.update_pressure(self.config.max_queue_size)
    }

    async fn wait_for_room(&self) -> Result<(), PoolError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.lock_state();
            if state.terminated {
                return Err(PoolError::Terminated);
            }
            state.waiters.push_back(tx);
            // Room may have opened since the queue was found full.
            self.wake_waiters(&mut state);
        }
        let limit = self.config.backpressure_timeout;
        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(PoolError::Terminated),
            Err(_) => {
                tracing::debug!(timeout_ms = limit.as_millis() as u64, "Gave up waiting for queue room");
                Err(PoolError::BackpressureTimeout(limit))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Unit events
    // -----------------------------------------------------------------------

    fn on_response(self: &Arc<Self>, unit: UnitId, response: UnitResponse) {
        match response {
            UnitResponse::Ready { id } => {
                let mut state = self.lock_state();
                if let Some(entry) = state.unit_mut(unit) {
                    entry.ready = true;
                }
                state.startup_failures = 0;
                tracing::debug!(unit = %id, "Unit ready");
            }
            UnitResponse::Result {
                id,
                payload,
                transfer,
            } => self.complete(
                unit,
                id,
                Ok(Transport {
                    data: payload,
                    transfer,
                }),
            ),
            UnitResponse::Error { id, name, message } => self.complete(
                unit,
                id,
                Err(HandlerFailure {
                    name: name.unwrap_or_else(|| "Error".to_string()),
                    message,
                }),
            ),
        }
    }

    fn complete(
        self: &Arc<Self>,
        unit: UnitId,
        id: TaskId,
        outcome: Result<Transport, HandlerFailure>,
    ) {
        let (pending, pressure) = {
            let mut state = self.lock_state();
            let owned = state.pending.get(&id).is_some_and(|p| p.unit == unit);
            if !owned {
                tracing::debug!(task_id = %id, unit = %unit, "Dropping result for abandoned task");
                return;
            }
            let Some(pending) = state.pending.remove(&id) else { return };
            pending.cancel_timer();
            state.release_unit(unit);
            self.record_finished(&mut state, outcome.is_ok(), Some(pending.started.elapsed()));
            let pressure = self.settle(&mut state);
            (pending, pressure)
        };
        self.fire_pressure(pressure);

        let result = match outcome {
            Ok(transport) => deserialize(transport).map_err(PoolError::from),
            Err(failure) => Err(PoolError::Handler(failure)),
        };
        tracing::trace!(task_id = %id, ok = result.is_ok(), "Task finished");
        if pending.reply.send(result).is_err() {
            tracing::trace!(task_id = %id, "Caller went away before the result arrived");
        }
    }

    fn on_timeout(self: &Arc<Self>, id: TaskId) {
        let (pending, pressure) = {
            let mut state = self.lock_state();
            let Some(pending) = state.pending.remove(&id) else { return };
            state.release_unit(pending.unit);
            self.record_finished(&mut state, false, Some(pending.timeout));
            tracing::warn!(
                task_id = %id,
                unit = %pending.unit,
                timeout_ms = pending.timeout.as_millis() as u64,
                "Task timed out"
            );
            let pressure = self.settle(&mut state);
            (pending, pressure)
        };
        self.fire_pressure(pressure);
        let _ = pending.reply.send(Err(PoolError::TaskTimeout(pending.timeout)));
    }

    fn on_unit_exit(self: &Arc<Self>, unit: UnitId) {
        let (orphan, reason, pressure) = {
            let mut state = self.lock_state();
            if state.terminated {
                return;
            }
            // Reaped or already handled.
            let Some(index) = state.units.iter().position(|u| u.id == unit) else { return };
            let mut entry = state.units.remove(index);
            let reason = entry
                .handle
                .exit_reason()
                .unwrap_or_else(|| "unit exited unexpectedly".to_string());
            entry.handle.terminate();
            tracing::error!(unit = %unit, %reason, busy = entry.task.is_some(), "Unit fault");

            let orphan = entry.task.and_then(|id| state.pending.remove(&id));
            if let Some(p) = &orphan {
                p.cancel_timer();
                self.record_finished(&mut state, false, Some(p.started.elapsed()));
            }

            if !entry.ready {
                state.startup_failures += 1;
            }
            if state.startup_failures < MAX_STARTUP_FAILURES {
                self.refill(&mut state);
            } else {
                tracing::warn!(
                    unit = %unit,
                    failures = state.startup_failures,
                    "Units keep failing before ready, not replacing until one starts"
                );
            }
            let pressure = self.settle(&mut state);
            (orphan, reason, pressure)
        };
        self.fire_pressure(pressure);
        if let Some(p) = orphan {
            let _ = p.reply.send(Err(PoolError::UnitFault(reason)));
        }
    }
}

/// Dynamically sized pool of isolated execution units.
///
/// Must be created inside a tokio runtime. Dropping the pool terminates it.
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("handler", &self.inner.config.handler)
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl Pool {
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let spawner = config
            .spawner
            .clone()
            .ok_or_else(|| PoolError::InvalidConfig("no unit spawner configured".to_string()))?;
        let runtime = Handle::try_current().map_err(|_| {
            PoolError::InvalidConfig("pool must be created inside a tokio runtime".to_string())
        })?;

        let state = PoolState {
            terminated: false,
            min_units: config.min_units,
            max_units: config.max_units,
            units: Vec::new(),
            queue: config.scheduling.build(),
            pending: HashMap::new(),
            waiters: VecDeque::new(),
            next_task_id: 0,
            stats: Stats::default(),
            pressured: false,
            reap_timer: None,
            startup_failures: 0,
        };
        let inner = Arc::new(PoolInner {
            config,
            spawner,
            runtime,
            state: StdMutex::new(state),
        });

        {
            let mut state = inner.lock_state();
            inner.ensure_min_units(&mut state)?;
        }
        tracing::info!(
            handler = %inner.config.handler,
            min_units = inner.config.min_units,
            max_units = inner.config.max_units,
            "Pool started"
        );
        Ok(Self { inner })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Current `(min_units, max_units)`, reflecting any resize.
    pub fn bounds(&self) -> (usize, usize) {
        let state = self.inner.lock_state();
        (state.min_units, state.max_units)
    }

    /// Run `payload` on a unit and wait for its result.
    pub async fn exec(&self, payload: Value, options: ExecOptions) -> Result<Value, PoolError> {
        let inner = &self.inner;
        let (tx, rx) = oneshot::channel();

        let (admission, pressure) = {
            let mut state = inner.lock_state();
            if state.terminated {
                return Err(PoolError::Terminated);
            }
            let task = QueuedTask {
                id: state.allocate_id(),
                priority: options.priority,
                enqueued_at: Instant::now(),
                payload,
                transfer: options.transfer,
                timeout: options.timeout,
                reply: tx,
            };
            let admission = inner.admit(&mut state, task, false)?;
            (admission, state.update_pressure(inner.config.max_queue_size))
        };
        inner.fire_pressure(pressure);

        if let Admission::Full(task, queued) = admission {
            match inner.config.backpressure_strategy {
                BackpressureStrategy::Reject => {
                    tracing::debug!(task_id = %task.id, queued, "Queue full, rejecting task");
                    return Err(PoolError::QueueFull(queued));
                }
                BackpressureStrategy::Wait => {
                    inner.wait_for_room().await?;
                    let pressure = {
                        let mut state = inner.lock_state();
                        if state.terminated {
                            return Err(PoolError::Terminated);
                        }
                        inner.admit(&mut state, task, true)?;
                        state.update_pressure(inner.config.max_queue_size)
                    };
                    inner.fire_pressure(pressure);
                }
            }
        }

        rx.await.unwrap_or(Err(PoolError::Terminated))
    }

    /// Run every item, at most `concurrency` at a time, returning results in
    /// input order. The first failure fails the whole call; tasks already
    /// dispatched keep running and their results are discarded.
    pub async fn map<I>(&self, items: I, options: MapOptions) -> Result<Vec<Value>, PoolError>
    where
        I: IntoIterator<Item = Value>,
    {
        let items: Vec<Value> = items.into_iter().collect();
        let concurrency = options
            .concurrency
            .unwrap_or_else(|| self.bounds().1)
            .max(1);
        let mut results: Vec<Option<Value>> = (0..items.len()).map(|_| None).collect();

        let calls = items.into_iter().enumerate().map(|(index, item)| {
            let transfer = options
                .transfer
                .as_ref()
                .map(|extract| extract(&item, index))
                .unwrap_or_default();
            let exec_options = ExecOptions {
                timeout: options.timeout,
                transfer,
                priority: options.priority,
            };
            async move { (index, self.exec(item, exec_options).await) }
        });
        let mut in_flight = futures::stream::iter(calls).buffer_unordered(concurrency);

        while let Some((index, result)) = in_flight.next().await {
            results[index] = Some(result?);
        }
        Ok(results.into_iter().map(|r| r.unwrap_or(Value::Null)).collect())
    }

    pub fn metrics(&self) -> PoolMetrics {
        let state = self.inner.lock_state();
        let busy = state.units.iter().filter(|u| !u.is_idle()).count();
        let queued = state.queue.len();
        let avg = state.stats.average();
        PoolMetrics {
            total_units: state.units.len(),
            idle_units: state.units.len() - busy,
            busy_units: busy,
            pending_tasks: state.pending.len() + queued,
            queued_tasks: queued,
            completed_tasks: state.stats.completed,
            failed_tasks: state.stats.failed,
            avg_task_duration: avg,
        }
    }

    pub fn queue_size(&self) -> usize {
        self.inner.lock_state().queue.len()
    }

    /// Whether queue occupancy is at or above 80% of `max_queue_size`.
    pub fn is_pressured(&self) -> bool {
        self.inner.lock_state().pressured
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.lock_state().terminated
    }

    /// Change the unit bounds. Spawns up to the new minimum right away; units
    /// above the new maximum go once they have been idle for `idle_timeout`.
    pub fn resize(&self, min_units: usize, max_units: usize) -> Result<(), PoolError> {
        PoolConfig::check_bounds(min_units, max_units)?;
        let inner = &self.inner;
        let pressure = {
            let mut state = inner.lock_state();
            if state.terminated {
                return Err(PoolError::Terminated);
            }
            state.min_units = min_units;
            state.max_units = max_units;
            inner.ensure_min_units(&mut state)?;
            inner.reap_idle(&mut state);
            tracing::info!(min_units, max_units, total = state.units.len(), "Pool resized");
            inner.settle(&mut state)
        };
        inner.fire_pressure(pressure);
        Ok(())
    }

    /// Fail everything outstanding with `Terminated` and stop every unit.
    pub fn terminate(&self) {
        let (pending, queued, units) = {
            let mut state = self.inner.lock_state();
            if state.terminated {
                return;
            }
            state.terminated = true;
            if let Some(timer) = state.reap_timer.take() {
                timer.abort();
            }
            state.waiters.clear();
            let pending: Vec<PendingTask> = state.pending.drain().map(|(_, p)| p).collect();
            let queued = state.queue.clear();
            let units: Vec<UnitEntry> = state.units.drain(..).collect();
            (pending, queued, units)
        };

        let (in_flight, waiting, count) = (pending.len(), queued.len(), units.len());
        for p in pending {
            p.cancel_timer();
            let _ = p.reply.send(Err(PoolError::Terminated));
        }
        for task in queued {
            let _ = task.reply.send(Err(PoolError::Terminated));
        }
        for mut unit in units {
            unit.handle.terminate();
        }
        tracing::info!(units = count, in_flight, queued = waiting, "Pool terminated");
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.terminate();
    }
}
