//! # Middleflow
//!
//! A middleware execution engine.
//!
//! Middleflow runs a request through an ordered list of middleware wrapped
//! around a terminal handler, with support for:
//!
//! - **Russian-doll nesting**: each stage runs code before and after the rest of the chain
//! - **Resilience**: per-stage retry with backoff, circuit breaking, and panic isolation
//! - **Composition**: conditional chains and parallel fan-out over sub-chains
//! - **Context management**: cancellable, deadline-bound contexts with TTL tracking and pooling
//! - **Observability**: execution metrics and structured engine events
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use middleflow::prelude::*;
//!
//! let chain = ExecutionChain::new(
//!     ExecutionConfig::new("api").with_retry(RetryPolicy::new(2)),
//! )
//! .with_middleware(Arc::new(AuthMiddleware::new()))
//! .with_middleware(Arc::new(RateLimitMiddleware::new()))
//! .with_handler(Arc::new(ApiHandler::new()));
//!
//! let response = chain.execute(&ExecutionContext::background(), request).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod chain;
pub mod context;
pub mod errors;
pub mod events;
pub mod middleware;
pub mod observability;
pub mod resilience;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::chain::{
        Chain, ChainSettings, ConditionalChain, ExecutionChain, ExecutionConfig,
        MiddlewareRegistry, ParallelChain,
    };
    pub use crate::context::{
        CancelHandle, ContextLifecycle, ContextManager, ContextManagerConfig, ExecutionContext,
        PooledContextManager,
    };
    pub use crate::errors::{CancelCause, ChainError, ChainResult, ErrorKind};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::middleware::{FnHandler, FnMiddleware, Handler, Middleware, Next, Passthrough, Payload};
    pub use crate::observability::MetricsSnapshot;
    pub use crate::resilience::{
        BackoffConfig, BackoffStrategy, CircuitBreaker, ConsecutiveFailureBreaker, JitterStrategy,
        RetryPolicy,
    };
    pub use crate::utils::{Clock, ManualClock, TokioClock};
    pub use std::sync::Arc;
}
