use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use super::PoolError;
use crate::bridge::protocol::HandlerRef;
use crate::handler::HandlerRegistry;
use crate::scheduler::SchedulingPolicy;
use crate::unit::{ThreadSpawner, UnitSpawner};

/// What a submission does when it has to queue and the queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackpressureStrategy {
    /// Fail immediately with `QueueFull`.
    #[default]
    Reject,
    /// Wait up to `backpressure_timeout` for room.
    Wait,
}

impl FromStr for BackpressureStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "wait" => Ok(Self::Wait),
            other => Err(format!("expected reject or wait, got {other:?}")),
        }
    }
}

/// Queue occupancy crossed 80% of the configured maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PressureEvent {
    pub queue_size: usize,
    pub max_queue_size: usize,
}

pub type PressureCallback = Arc<dyn Fn(PressureEvent) + Send + Sync>;

pub const ENV_MIN_UNITS: &str = "ISOPOOL_MIN_UNITS";
pub const ENV_MAX_UNITS: &str = "ISOPOOL_MAX_UNITS";
pub const ENV_IDLE_TIMEOUT_MS: &str = "ISOPOOL_IDLE_TIMEOUT_MS";
pub const ENV_TASK_TIMEOUT_MS: &str = "ISOPOOL_TASK_TIMEOUT_MS";
pub const ENV_MAX_QUEUE_SIZE: &str = "ISOPOOL_MAX_QUEUE_SIZE";
pub const ENV_BACKPRESSURE: &str = "ISOPOOL_BACKPRESSURE";
pub const ENV_BACKPRESSURE_TIMEOUT_MS: &str = "ISOPOOL_BACKPRESSURE_TIMEOUT_MS";

#[derive(Clone)]
pub struct PoolConfig {
    pub handler: HandlerRef,
    pub min_units: usize,
    pub max_units: usize,
    /// Idle units above `min_units` are reaped after this long.
    pub idle_timeout: Duration,
    /// Default per-task timeout. Zero disables it.
    pub task_timeout: Duration,
    pub track_metrics: bool,
    /// `None` means unbounded.
    pub max_queue_size: Option<usize>,
    pub backpressure_strategy: BackpressureStrategy,
    pub backpressure_timeout: Duration,
    pub on_pressure: Option<PressureCallback>,
    pub scheduling: SchedulingPolicy,
    pub spawner: Option<Arc<dyn UnitSpawner>>,
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("handler", &self.handler)
            .field("min_units", &self.min_units)
            .field("max_units", &self.max_units)
            .field("idle_timeout", &self.idle_timeout)
            .field("task_timeout", &self.task_timeout)
            .field("track_metrics", &self.track_metrics)
            .field("max_queue_size", &self.max_queue_size)
            .field("backpressure_strategy", &self.backpressure_strategy)
            .field("backpressure_timeout", &self.backpressure_timeout)
            .field("on_pressure", &self.on_pressure.is_some())
            .field("scheduling", &self.scheduling)
            .field("spawner", &self.spawner.is_some())
            .finish()
    }
}

fn default_max_units() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl PoolConfig {
    pub fn new(handler: HandlerRef) -> Self {
        Self {
            handler,
            min_units: 1,
            max_units: default_max_units(),
            idle_timeout: Duration::from_secs(30),
            task_timeout: Duration::from_secs(60),
            track_metrics: true,
            max_queue_size: None,
            backpressure_strategy: BackpressureStrategy::Reject,
            backpressure_timeout: Duration::from_secs(30),
            on_pressure: None,
            scheduling: SchedulingPolicy::Priority,
            spawner: None,
        }
    }

    /// Thread units running `handler` from `registry`.
    pub fn threads(handler: impl Into<String>, registry: HandlerRegistry) -> Self {
        Self::new(HandlerRef::Named(handler.into()))
            .with_spawner(Arc::new(ThreadSpawner::new(registry)))
    }

    pub fn with_min_units(mut self, n: usize) -> Self {
        self.min_units = n;
        self
    }

    pub fn with_max_units(mut self, n: usize) -> Self {
        self.max_units = n;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, track: bool) -> Self {
        self.track_metrics = track;
        self
    }

    pub fn with_max_queue_size(mut self, max: usize) -> Self {
        self.max_queue_size = Some(max);
        self
    }

    pub fn with_backpressure(mut self, strategy: BackpressureStrategy) -> Self {
        self.backpressure_strategy = strategy;
        self
    }

    pub fn with_backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.backpressure_timeout = timeout;
        self
    }

    pub fn on_pressure(mut self, callback: impl Fn(PressureEvent) + Send + Sync + 'static) -> Self {
        self.on_pressure = Some(Arc::new(callback));
        self
    }

    pub fn with_scheduling(mut self, policy: SchedulingPolicy) -> Self {
        self.scheduling = policy;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn UnitSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    pub(crate) fn check_bounds(min_units: usize, max_units: usize) -> Result<(), PoolError> {
        if max_units == 0 {
            return Err(PoolError::InvalidConfig(
                "max_units must be at least 1".to_string(),
            ));
        }
        if min_units > max_units {
            return Err(PoolError::InvalidConfig(format!(
                "min_units ({min_units}) exceeds max_units ({max_units})"
            )));
        }
        Ok(())
    }

    /// Bounds, spawner presence and, for inline handlers, the closure lint.
    pub fn validate(&self) -> Result<(), PoolError> {
        Self::check_bounds(self.min_units, self.max_units)?;
        if self.spawner.is_none() {
            return Err(PoolError::InvalidConfig(
                "no unit spawner configured".to_string(),
            ));
        }
        if let HandlerRef::Inline(source) = &self.handler {
            closure_lint::validate(source)?;
        }
        Ok(())
    }

    /// Overlay `ISOPOOL_*` environment variables.
    pub fn apply_env(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Overlay settings from `lookup`. Values that do not parse are ignored.
    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(n) = parse_override(&lookup, ENV_MIN_UNITS) {
            self.min_units = n;
        }
        if let Some(n) = parse_override(&lookup, ENV_MAX_UNITS) {
            self.max_units = n;
        }
        if let Some(ms) = parse_override(&lookup, ENV_IDLE_TIMEOUT_MS) {
            self.idle_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_override(&lookup, ENV_TASK_TIMEOUT_MS) {
            self.task_timeout = Duration::from_millis(ms);
        }
        if let Some(raw) = lookup(ENV_MAX_QUEUE_SIZE) {
            match raw.trim() {
                "" | "none" | "unbounded" => self.max_queue_size = None,
                _ => {
                    if let Some(n) = parse_override(&lookup, ENV_MAX_QUEUE_SIZE) {
                        self.max_queue_size = Some(n);
                    }
                }
            }
        }
        if let Some(strategy) = parse_override(&lookup, ENV_BACKPRESSURE) {
            self.backpressure_strategy = strategy;
        }
        if let Some(ms) = parse_override(&lookup, ENV_BACKPRESSURE_TIMEOUT_MS) {
            self.backpressure_timeout = Duration::from_millis(ms);
        }
        self
    }
}

fn parse_override<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "Ignoring invalid pool override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    fn threads() -> PoolConfig {
        PoolConfig::threads("echo", HandlerRegistry::new())
    }

    #[test]
    fn defaults() {
        let config = PoolConfig::new(HandlerRef::named("echo"));
        assert_eq!(config.min_units, 1);
        assert!(config.max_units >= 1);
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.task_timeout, Duration::from_secs(60));
        assert_eq!(config.max_queue_size, None);
        assert_eq!(config.backpressure_strategy, BackpressureStrategy::Reject);
        assert_eq!(config.scheduling, SchedulingPolicy::Priority);
        assert!(config.track_metrics);
    }

    #[test]
    fn overrides_apply() {
        let config = threads().apply_overrides(lookup(&[
            (ENV_MIN_UNITS, "2"),
            (ENV_MAX_UNITS, "8"),
            (ENV_IDLE_TIMEOUT_MS, "1500"),
            (ENV_TASK_TIMEOUT_MS, "0"),
            (ENV_MAX_QUEUE_SIZE, "100"),
            (ENV_BACKPRESSURE, "Wait"),
            (ENV_BACKPRESSURE_TIMEOUT_MS, "250"),
        ]));
        assert_eq!(config.min_units, 2);
        assert_eq!(config.max_units, 8);
        assert_eq!(config.idle_timeout, Duration::from_millis(1500));
        assert_eq!(config.task_timeout, Duration::ZERO);
        assert_eq!(config.max_queue_size, Some(100));
        assert_eq!(config.backpressure_strategy, BackpressureStrategy::Wait);
        assert_eq!(config.backpressure_timeout, Duration::from_millis(250));
    }

    #[test]
    fn bad_overrides_are_ignored() {
        let config = threads()
            .with_min_units(3)
            .with_max_units(5)
            .with_max_queue_size(10)
            .apply_overrides(lookup(&[
                (ENV_MIN_UNITS, "three"),
                (ENV_MAX_UNITS, "-1"),
                (ENV_MAX_QUEUE_SIZE, "lots"),
                (ENV_BACKPRESSURE, "drop"),
            ]));
        assert_eq!(config.min_units, 3);
        assert_eq!(config.max_units, 5);
        assert_eq!(config.max_queue_size, Some(10));
        assert_eq!(config.backpressure_strategy, BackpressureStrategy::Reject);
    }

    #[test]
    fn queue_size_can_be_unbounded_by_override() {
        let config = threads()
            .with_max_queue_size(10)
            .apply_overrides(lookup(&[(ENV_MAX_QUEUE_SIZE, "unbounded")]));
        assert_eq!(config.max_queue_size, None);
    }

    #[test]
    fn validate_bounds() {
        assert!(threads().with_min_units(0).with_max_units(1).validate().is_ok());
        assert_eq!(
            threads().with_max_units(0).validate(),
            Err(PoolError::InvalidConfig("max_units must be at least 1".into()))
        );
        assert!(matches!(
            threads().with_min_units(4).with_max_units(2).validate(),
            Err(PoolError::InvalidConfig(_))
        ));
    }

    #[test]
    fn validate_requires_spawner() {
        let err = PoolConfig::new(HandlerRef::named("echo"))
            .with_max_units(1)
            .validate()
            .unwrap_err();
        assert_eq!(err, PoolError::InvalidConfig("no unit spawner configured".into()));
    }

    #[test]
    fn inline_handlers_are_linted() {
        let base = threads().with_max_units(1);
        let mut config = base.clone();
        config.handler = HandlerRef::inline("(x) => x * factor");
        assert_eq!(
            config.validate(),
            Err(PoolError::ClosureViolation(vec!["factor".into()]))
        );

        let mut config = base;
        config.handler = HandlerRef::inline("(x, factor) => x * factor");
        assert!(config.validate().is_ok());
    }
}
