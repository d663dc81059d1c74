//! Named strategy registry
//!
//! Every policy-pluggable subsystem (autoscaling, upgrades, zone placement,
//! spot provider adapters) keeps its implementations in a
//! [`StrategyRegistry`]. Registration is keyed by the implementation's own
//! name; registering a second implementation under the same name replaces
//! the first (last write wins).

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

/// Anything that can be stored in a [`StrategyRegistry`]
pub trait Named {
    /// Registry key for this implementation
    fn name(&self) -> &str;
}

/// Errors from registry lookups
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Strategy '{0}' not found")]
    NotFound(String),
}

/// Name → implementation map guarded by sharded read-write locks
pub struct StrategyRegistry<T: ?Sized> {
    entries: DashMap<String, Arc<T>>,
}

impl<T: ?Sized + Named> StrategyRegistry<T> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Register an implementation under its own name, replacing any previous one
    pub fn register(&self, strategy: Arc<T>) {
        let name = strategy.name().to_string();
        self.entries.insert(name, strategy);
    }

    /// Look up an implementation by name
    pub fn get(&self, name: &str) -> Result<Arc<T>, RegistryError> {
        self.entries
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Names of every registered implementation, in no particular order
    pub fn list(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: ?Sized + Named> Default for StrategyRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
