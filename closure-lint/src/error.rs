use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LintError {
    #[error("handler source is empty")]
    EmptySource,

    #[error("handler is not a function: expected `function (...) {{ }}` or `(...) => ...`")]
    NotAFunction,

    #[error("unterminated {0} in handler source")]
    Unterminated(&'static str),

    #[error("unbalanced `{0}` in handler source")]
    Unbalanced(String),

    #[error(
        "handler references identifiers that do not exist inside an isolated unit: {} (pass them as parameters instead)",
        .names.join(", ")
    )]
    ClosureViolation { names: Vec<String> },
}

impl LintError {
    /// Offending identifiers, if this is a closure violation.
    pub fn violations(&self) -> &[String] {
        match self {
            Self::ClosureViolation { names } => names,
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, LintError>;
