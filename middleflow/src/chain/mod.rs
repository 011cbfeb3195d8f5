//! Chain building and execution.
//!
//! This module provides:
//! - The [`Chain`] trait shared by every chain variant
//! - Runtime and serializable chain configuration
//! - The sequential [`ExecutionChain`]
//! - [`ConditionalChain`] and [`ParallelChain`] compositions
//! - A [`MiddlewareRegistry`] for building chains from settings

mod conditional;
mod config;
mod executor;
mod parallel;
mod registry;


pub use conditional::ConditionalChain;
pub use config::{BreakerSettings, ChainSettings, ExecutionConfig, MiddlewareSpec};
pub use executor::ExecutionChain;
pub use parallel::ParallelChain;
pub use registry::{MiddlewareFactory, MiddlewareRegistry};

use crate::context::ExecutionContext;
use crate::errors::ChainResult;
use crate::middleware::{Middleware, Payload};
use crate::observability::MetricsSnapshot;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

/// Common interface of every chain variant.
///
/// Mutating operations take `&self`; implementations synchronize internally
/// so a chain can be shared across tasks behind an `Arc`.
#[async_trait]
pub trait Chain<T: Payload = serde_json::Value>: Send + Sync + Debug {
    /// Returns the chain name from the current config.
    fn name(&self) -> String;

    /// Runs the request through the chain.
    async fn execute(&self, ctx: &ExecutionContext, request: T) -> ChainResult<T>;

    /// Appends a middleware as the innermost stage.
    fn add_middleware(&self, middleware: Arc<dyn Middleware<T>>);

    /// Inserts a middleware as the outermost stage.
    fn prepend_middleware(&self, middleware: Arc<dyn Middleware<T>>);

    /// Removes every middleware and resets metrics.
    fn clear(&self);

    /// Returns the number of middleware.
    fn count(&self) -> usize;

    /// Returns a copy of the middleware list, outermost first.
    fn middlewares(&self) -> Vec<Arc<dyn Middleware<T>>>;

    /// Returns a snapshot of the chain's metrics.
    fn metrics(&self) -> MetricsSnapshot;

    /// Returns the current config.
    fn config(&self) -> Arc<ExecutionConfig>;

    /// Replaces the config for subsequent executions.
    fn update_config(&self, config: ExecutionConfig);
}
