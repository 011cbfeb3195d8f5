//! Failure handling around individual stage calls.
//!
//! This module provides:
//! - [`RetryPolicy`] with configurable backoff and jitter
//! - [`CircuitBreaker`] and the [`ConsecutiveFailureBreaker`] policy
//! - Panic isolation that turns a stage panic into an error

mod breaker;
mod invoker;
mod isolation;
mod retry;

pub use breaker::{BreakerState, CircuitBreaker, ConsecutiveFailureBreaker};
#[cfg(test)]
pub use breaker::MockCircuitBreaker;
pub(crate) use invoker::{invoke_stage, StageCall, TraversalState};
pub use isolation::{catch_panic, isolate, panic_message};
pub use retry::{BackoffConfig, BackoffFn, BackoffStrategy, JitterStrategy, RetryPolicy, Retryable};
