//! Named-instance store
//!
//! Components are shared as `Arc<T>` and looked up by name. A configuration
//! refresh never mutates a live instance: [`Registry::replace`] swaps in a
//! freshly built one, and callers holding the old `Arc` finish on it.

use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::ConfigResult;

/// Concurrent map from instance name to shared component
pub struct Registry<T> {
    instances: DashMap<String, Arc<T>>,
}

impl<T> Registry<T> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self { instances: DashMap::new() }
    }

    /// Look up an instance by name
    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.instances.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.instances.contains_key(name)
    }

    /// Look up `name`, creating it with `create` on first use
    ///
    /// Concurrent callers for the same name all receive the same instance;
    /// `create` runs at most once per name.
    pub fn get_or_insert_with<F>(&self, name: &str, create: F) -> Arc<T>
    where
        F: FnOnce() -> T,
    {
        if let Some(existing) = self.get(name) {
            return existing;
        }
        let entry = self.instances.entry(name.to_owned()).or_insert_with(|| {
            debug!(instance = name, "Creating registry instance");
            Arc::new(create())
        });
        Arc::clone(entry.value())
    }

    /// Like [`get_or_insert_with`](Self::get_or_insert_with) for fallible
    /// constructors; nothing is stored when `create` fails
    pub fn try_get_or_insert_with<F>(&self, name: &str, create: F) -> ConfigResult<Arc<T>>
    where
        F: FnOnce() -> ConfigResult<T>,
    {
        if let Some(existing) = self.get(name) {
            return Ok(existing);
        }
        match self.instances.entry(name.to_owned()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let instance = Arc::new(create()?);
                debug!(instance = name, "Creating registry instance");
                entry.insert(Arc::clone(&instance));
                Ok(instance)
            }
        }
    }

    /// Install `instance` under `name`, returning the one it replaced
    pub fn replace(&self, name: &str, instance: T) -> Option<Arc<T>> {
        let previous = self.instances.insert(name.to_owned(), Arc::new(instance));
        info!(instance = name, replaced = previous.is_some(), "Registry instance installed");
        previous
    }

    /// Drop `name`; live holders keep their `Arc`
    pub fn remove(&self, name: &str) -> Option<Arc<T>> {
        self.instances.remove(name).map(|(_, instance)| instance)
    }

    /// Registered names in sorted order
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.instances.iter().map(|entry| entry.key().clone()).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered instances
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("names", &self.names()).finish()
    }
}
