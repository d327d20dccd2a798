use std::time::Duration;

use closure_lint::error::LintError;

use crate::handler::HandlerFailure;
use crate::serializer::SerializeError;
use crate::unit::SpawnError;

/// Why a submission or pool operation failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PoolError {
    #[error("pool has been terminated")]
    Terminated,

    #[error("task queue is full ({0} queued)")]
    QueueFull(usize),

    #[error("no queue space freed up within {0:?}")]
    BackpressureTimeout(Duration),

    #[error("task timed out after {0:?}")]
    TaskTimeout(Duration),

    #[error("execution unit failed: {0}")]
    UnitFault(String),

    #[error(transparent)]
    Handler(#[from] HandlerFailure),

    #[error(
        "handler references identifiers that do not exist inside an isolated unit: {}",
        .0.join(", ")
    )]
    ClosureViolation(Vec<String>),

    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn execution unit: {0}")]
    Spawn(String),

    #[error("payload could not be decoded: {0}")]
    Serialize(#[from] SerializeError),
}

impl PoolError {
    /// Rejected by backpressure rather than failed; resubmitting later may succeed.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Self::QueueFull(_) | Self::BackpressureTimeout(_))
    }
}

impl From<SpawnError> for PoolError {
    fn from(e: SpawnError) -> Self {
        Self::Spawn(e.to_string())
    }
}

impl From<LintError> for PoolError {
    fn from(e: LintError) -> Self {
        match e {
            LintError::ClosureViolation { names } => Self::ClosureViolation(names),
            other => Self::InvalidConfig(format!("handler source: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lint_violations_keep_names() {
        let err = PoolError::from(LintError::ClosureViolation {
            names: vec!["a".into(), "b".into()],
        });
        assert_eq!(err, PoolError::ClosureViolation(vec!["a".into(), "b".into()]));
        insta::assert_snapshot!(
            err.to_string(),
            @"handler references identifiers that do not exist inside an isolated unit: a, b"
        );
    }

    #[test]
    fn other_lint_errors_are_config_errors() {
        let err = PoolError::from(LintError::EmptySource);
        assert!(matches!(err, PoolError::InvalidConfig(_)));
    }

    #[test]
    fn handler_failures_display_verbatim() {
        let err = PoolError::from(HandlerFailure::named("TypeError", "x is not a function"));
        assert_eq!(err.to_string(), "TypeError: x is not a function");
    }

    #[test]
    fn backpressure_classification() {
        assert!(PoolError::QueueFull(3).is_backpressure());
        assert!(PoolError::BackpressureTimeout(Duration::from_secs(1)).is_backpressure());
        assert!(!PoolError::Terminated.is_backpressure());
    }
}
