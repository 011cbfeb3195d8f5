//! Named middleware constructors.

use super::{Chain, ChainSettings, ExecutionChain};
use crate::errors::{ChainError, ChainResult};
use crate::middleware::{Middleware, Payload};
use crate::utils::Clock;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Builds a middleware from its configured properties.
pub type MiddlewareFactory<T> = Arc<
    dyn Fn(&HashMap<String, serde_json::Value>) -> ChainResult<Arc<dyn Middleware<T>>> + Send + Sync,
>;

/// Registry mapping middleware names to constructors.
///
/// Lets a chain be described in [`ChainSettings`] and assembled at runtime.
pub struct MiddlewareRegistry<T: Payload = serde_json::Value> {
    factories: RwLock<HashMap<String, MiddlewareFactory<T>>>,
}

impl<T: Payload> Default for MiddlewareRegistry<T> {
    fn default() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Payload> MiddlewareRegistry<T> {
    /// Creates a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor. Returns `true` if it replaced an existing one.
    pub fn register<F>(&self, name: impl Into<String>, factory: F) -> bool
    where
        F: Fn(&HashMap<String, serde_json::Value>) -> ChainResult<Arc<dyn Middleware<T>>>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        debug!(middleware = %name, "Registered middleware constructor");
        self.factories.write().insert(name, Arc::new(factory)).is_some()
    }

    /// Checks if a constructor is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    /// Returns the registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Builds one middleware.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Registry`] if `name` is unknown or its
    /// constructor fails.
    pub fn build(
        &self,
        name: &str,
        properties: &HashMap<String, serde_json::Value>,
    ) -> ChainResult<Arc<dyn Middleware<T>>> {
        let factory = self
            .factories
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ChainError::Registry(format!("unknown middleware '{name}'")))?;

        factory(properties)
            .map_err(|e| ChainError::Registry(format!("failed to build middleware '{name}': {e}")))
    }

    /// Builds an [`ExecutionChain`] from settings, middleware in listed order.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Configuration`] for invalid settings and
    /// [`ChainError::Registry`] for unknown or failing middleware.
    pub fn build_chain(&self, settings: &ChainSettings, clock: Arc<dyn Clock>) -> ChainResult<ExecutionChain<T>> {
        settings.validate()?;

        let stages = settings
            .middleware
            .iter()
            .map(|spec| self.build(&spec.name, &spec.properties))
            .collect::<ChainResult<Vec<_>>>()?;

        let chain = ExecutionChain::new(settings.clone().into_config(clock));
        for stage in stages {
            chain.add_middleware(stage);
        }
        Ok(chain)
    }
}

impl<T: Payload> std::fmt::Debug for MiddlewareRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareRegistry")
            .field("names", &self.names())
            .finish()
    }
}
