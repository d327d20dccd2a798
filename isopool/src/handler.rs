//! Task handlers and the registry units resolve them from.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::bridge::protocol::HandlerRef;
use crate::value::Value;

/// A handler's own failure. Name and message reach the caller unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{name}: {message}")]
pub struct HandlerFailure {
    pub name: String,
    pub message: String,
}

impl HandlerFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self::named("Error", message)
    }

    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Work that runs inside an execution unit, one payload at a time.
///
/// Handlers are synchronous: a unit is a dedicated thread or process, so
/// blocking here only blocks that unit.
pub trait TaskHandler: Send + Sync + 'static {
    fn handle(&self, payload: Value) -> Result<Value, HandlerFailure>;
}

impl<F> TaskHandler for F
where
    F: Fn(Value) -> Result<Value, HandlerFailure> + Send + Sync + 'static,
{
    fn handle(&self, payload: Value) -> Result<Value, HandlerFailure> {
        self(payload)
    }
}

/// Named handlers available to units.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: impl Into<String>, handler: impl TaskHandler) -> Self {
        self.insert(name, handler);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, handler: impl TaskHandler) {
        let name = name.into();
        if self.handlers.insert(name.clone(), Arc::new(handler)).is_some() {
            tracing::warn!(handler = %name, "Replacing previously registered handler");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Resolve a handler reference. Inline source is looked up by its exact
    /// text, so hosts can pre-register compiled forms of known snippets.
    pub fn resolve(&self, handler: &HandlerRef) -> Result<Arc<dyn TaskHandler>, String> {
        match handler {
            HandlerRef::Named(name) => self
                .get(name)
                .ok_or_else(|| format!("no handler registered as {name:?}")),
            HandlerRef::Inline(source) => self
                .get(source)
                .ok_or_else(|| "inline handler source is not registered with this unit".to_string()),
        }
    }
}
