//! Execution contexts and their lifecycle.
//!
//! This module provides:
//! - [`ExecutionContext`], the cancellation/deadline/metadata carrier passed
//!   through every stage
//! - [`MetadataBag`], the thread-safe map shared by derived contexts
//! - [`ContextManager`] and [`PooledContextManager`], which track live
//!   contexts, expire them on a timer, and optionally recycle metadata maps

mod bags;
mod execution;
mod manager;
mod pool;

pub use bags::MetadataBag;
pub use execution::{CancelHandle, ExecutionContext};
pub use manager::{
    ContextLifecycle, ContextManager, ContextManagerConfig, ContextStats, PooledContextManager,
};
