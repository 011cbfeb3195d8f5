//! A chain that only runs when a predicate holds.

use super::{Chain, ExecutionChain, ExecutionConfig};
use crate::context::ExecutionContext;
use crate::errors::ChainResult;
use crate::middleware::{Handler, Middleware, Payload};
use crate::observability::MetricsSnapshot;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

type Predicate<T> = Arc<dyn Fn(&ExecutionContext, &T) -> bool + Send + Sync>;

/// Wraps an [`ExecutionChain`] behind a predicate over the context and request.
///
/// When the predicate is false the request is returned unchanged and nothing
/// is recorded in the base chain's metrics.
pub struct ConditionalChain<T: Payload = serde_json::Value> {
    base: ExecutionChain<T>,
    predicate: Predicate<T>,
}

impl<T: Payload> ConditionalChain<T> {
    /// Creates a conditional chain over a fresh base chain.
    pub fn new<P>(config: ExecutionConfig, predicate: P) -> Self
    where
        P: Fn(&ExecutionContext, &T) -> bool + Send + Sync + 'static,
    {
        Self::wrap(ExecutionChain::new(config), predicate)
    }

    /// Wraps an existing chain.
    pub fn wrap<P>(base: ExecutionChain<T>, predicate: P) -> Self
    where
        P: Fn(&ExecutionContext, &T) -> bool + Send + Sync + 'static,
    {
        Self {
            base,
            predicate: Arc::new(predicate),
        }
    }

    /// Sets the base chain's terminal handler.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn Handler<T>>) -> Self {
        self.base = self.base.with_handler(handler);
        self
    }

    /// Appends a middleware and returns `self` for chaining.
    #[must_use]
    pub fn with_middleware(self, middleware: Arc<dyn Middleware<T>>) -> Self {
        self.base.add_middleware(middleware);
        self
    }

    /// Returns the wrapped chain.
    pub fn base(&self) -> &ExecutionChain<T> {
        &self.base
    }
}

impl<T: Payload> std::fmt::Debug for ConditionalChain<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionalChain")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<T: Payload> Chain<T> for ConditionalChain<T> {
    fn name(&self) -> String {
        self.base.name()
    }

    async fn execute(&self, ctx: &ExecutionContext, request: T) -> ChainResult<T> {
        if !(self.predicate)(ctx, &request) {
            debug!(chain = %self.base.name(), "Condition not met, skipping middleware chain");
            return Ok(request);
        }
        self.base.execute(ctx, request).await
    }

    fn add_middleware(&self, middleware: Arc<dyn Middleware<T>>) {
        self.base.add_middleware(middleware);
    }

    fn prepend_middleware(&self, middleware: Arc<dyn Middleware<T>>) {
        self.base.prepend_middleware(middleware);
    }

    fn clear(&self) {
        self.base.clear();
    }

    fn count(&self) -> usize {
        self.base.count()
    }

    fn middlewares(&self) -> Vec<Arc<dyn Middleware<T>>> {
        self.base.middlewares()
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.base.metrics()
    }

    fn config(&self) -> Arc<ExecutionConfig> {
        self.base.config()
    }

    fn update_config(&self, config: ExecutionConfig) {
        self.base.update_config(config);
    }
}
