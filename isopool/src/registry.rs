//! Named pools shared across callers.
//!
//! Two call sites that describe the same work under the same name get the same
//! [`Pool`] instead of each spinning up their own units. The registry is an
//! ordinary value: construct one per application (or per test) and pass it
//! where it is needed.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::pool::{Pool, PoolError};

#[derive(Default)]
pub struct PoolRegistry {
    pools: DashMap<String, Arc<Pool>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing pool under `name`, or the one `factory` builds.
    ///
    /// The factory runs without any registry lock held, so it may itself use
    /// the registry. If it fails nothing is stored and the error is returned.
    /// When two callers race on the same name, the first pool stored wins and
    /// the other is terminated.
    pub fn get_or_create<F>(&self, name: &str, factory: F) -> Result<Arc<Pool>, PoolError>
    where
        F: FnOnce() -> Result<Pool, PoolError>,
    {
        if let Some(pool) = self.get(name) {
            return Ok(pool);
        }
        let built = Arc::new(factory()?);
        match self.pools.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                let existing = Arc::clone(entry.get());
                drop(entry);
                tracing::debug!(name, "Pool registered concurrently, discarding duplicate");
                built.terminate();
                Ok(existing)
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&built));
                tracing::debug!(name, "Registered pool");
                Ok(built)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Pool>> {
        self.pools.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn has(&self, name: &str) -> bool {
        self.pools.contains_key(name)
    }

    /// Terminate and forget the pool under `name`. Returns whether one existed.
    pub fn delete(&self, name: &str) -> bool {
        match self.pools.remove(name) {
            Some((_, pool)) => {
                pool.terminate();
                tracing::debug!(name, "Removed pool");
                true
            }
            None => false,
        }
    }

    pub fn terminate_all(&self) {
        let names = self.list();
        for name in &names {
            if let Some((_, pool)) = self.pools.remove(name) {
                pool.terminate();
            }
        }
        tracing::info!(count = names.len(), "Terminated all pools");
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn size(&self) -> usize {
        self.pools.len()
    }
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("pools", &self.list())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerRegistry;
    use crate::pool::{ExecOptions, PoolConfig};
    use crate::value::Value;

    fn echo_pool() -> Result<Pool, PoolError> {
        let handlers = HandlerRegistry::new().register("echo", |v: Value| Ok(v));
        Pool::new(
            PoolConfig::threads("echo", handlers)
                .with_min_units(0)
                .with_max_units(1),
        )
    }

    #[tokio::test]
    async fn same_name_shares_one_pool() {
        let registry = PoolRegistry::new();
        let mut built = 0;
        let a = registry
            .get_or_create("resize-images", || {
                built += 1;
                echo_pool()
            })
            .unwrap();
        let b = registry
            .get_or_create("resize-images", || {
                built += 1;
                echo_pool()
            })
            .unwrap();

        assert_eq!(built, 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(
            b.exec(Value::from("hi"), ExecOptions::new()).await,
            Ok(Value::from("hi"))
        );
    }

    #[tokio::test]
    async fn failed_factory_stores_nothing() {
        let registry = PoolRegistry::new();
        let err = registry
            .get_or_create("broken", || {
                Pool::new(PoolConfig::threads("echo", HandlerRegistry::new()).with_max_units(0))
            })
            .unwrap_err();
        assert!(matches!(err, PoolError::InvalidConfig(_)));
        assert!(!registry.has("broken"));
        assert_eq!(registry.size(), 0);
    }

    #[tokio::test]
    async fn delete_terminates() {
        let registry = PoolRegistry::new();
        let pool = registry.get_or_create("a", echo_pool).unwrap();

        assert!(registry.delete("a"));
        assert!(!registry.delete("a"));
        assert!(pool.is_terminated());
        assert!(registry.get("a").is_none());
        assert_eq!(
            pool.exec(Value::Null, ExecOptions::new()).await,
            Err(PoolError::Terminated)
        );
    }

    #[tokio::test]
    async fn list_and_terminate_all() {
        let registry = PoolRegistry::new();
        let b = registry.get_or_create("b", echo_pool).unwrap();
        let a = registry.get_or_create("a", echo_pool).unwrap();
        assert_eq!(registry.list(), ["a", "b"]);
        assert_eq!(registry.size(), 2);

        registry.terminate_all();
        assert_eq!(registry.size(), 0);
        assert!(a.is_terminated() && b.is_terminated());
    }

    #[tokio::test]
    async fn factory_may_use_the_registry() {
        let registry = PoolRegistry::new();
        registry.get_or_create("base", echo_pool).unwrap();

        let pool = registry
            .get_or_create("derived", || {
                assert!(registry.has("base"));
                assert!(!registry.has("derived"));
                assert_eq!(registry.list(), ["base"]);
                registry.get_or_create("sibling", echo_pool)?;
                echo_pool()
            })
            .unwrap();

        assert!(Arc::ptr_eq(&pool, &registry.get("derived").unwrap()));
        assert_eq!(registry.list(), ["base", "derived", "sibling"]);
    }

    #[tokio::test]
    async fn losing_a_creation_race_keeps_the_stored_pool() {
        let registry = PoolRegistry::new();
        let mut inner = None;
        let outer = registry
            .get_or_create("shared", || {
                inner = Some(registry.get_or_create("shared", echo_pool).unwrap());
                echo_pool()
            })
            .unwrap();

        let inner = inner.unwrap();
        assert!(Arc::ptr_eq(&outer, &inner));
        assert!(!outer.is_terminated());
        assert_eq!(registry.size(), 1);
    }

    #[tokio::test]
    async fn registries_are_independent() {
        let first = PoolRegistry::new();
        let second = PoolRegistry::new();
        first.get_or_create("shared", echo_pool).unwrap();
        assert!(!second.has("shared"));
    }
}
