//! Free-identifier lint for handler source shipped to isolated units.
//!
//! A handler that runs inside an isolated unit is shipped as source text, not
//! as a closure, so any identifier it reads from its defining scope simply does
//! not exist on the other side. This crate flags such identifiers before any
//! task runs.
//!
//! The check is lexical and best effort: it tokenizes the source, flattens
//! scopes, and may over- or under-approximate on unusual syntax (shadowing,
//! `with`, `eval`, class fields). It is a lint, not a parser.

pub mod error;
pub mod globals;
pub mod lexer;
pub mod scope;

use indexmap::IndexSet;

use crate::error::{LintError, Result};
use crate::globals::{is_keyword, is_safe_global};
pub use crate::scope::{HandlerScope, analyze};

/// Closure validator with an optional set of extra allowed globals.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    allowed: IndexSet<String>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat `name` as available inside the unit (e.g. a host-injected helper).
    pub fn allow_global(mut self, name: impl Into<String>) -> Self {
        self.allowed.insert(name.into());
        self
    }

    /// Free identifiers of an analyzed handler, in first-appearance order.
    pub fn free_identifiers(&self, scope: &HandlerScope) -> Vec<String> {
        scope
            .references
            .iter()
            .filter(|name| {
                !scope.is_bound(name)
                    && !is_keyword(name)
                    && !is_safe_global(name)
                    && !self.allowed.contains(name.as_str())
            })
            .cloned()
            .collect()
    }

    /// Analyze `source` and reject it if it depends on unavailable names.
    pub fn validate(&self, source: &str) -> Result<HandlerScope> {
        let scope = analyze(source)?;
        let names = self.free_identifiers(&scope);
        if names.is_empty() {
            Ok(scope)
        } else {
            Err(LintError::ClosureViolation { names })
        }
    }
}

/// Validate with the default allow-list.
pub fn validate(source: &str) -> Result<HandlerScope> {
    Validator::new().validate(source)
}
