//! Mock middleware for testing.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use super::CallLog;
use crate::context::ExecutionContext;
use crate::errors::{ChainError, ChainResult};
use crate::middleware::{Middleware, Next, Payload};

/// A middleware that logs `name:before` and `name:after` around the rest of
/// the chain.
#[derive(Debug)]
pub struct RecordingMiddleware {
    name: String,
    log: CallLog,
}

impl RecordingMiddleware {
    /// Creates a new recording middleware writing to `log`.
    #[must_use]
    pub fn new(name: impl Into<String>, log: CallLog) -> Self {
        Self {
            name: name.into(),
            log,
        }
    }
}

#[async_trait]
impl<T: Payload> Middleware<T> for RecordingMiddleware {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, ctx: &ExecutionContext, request: T, next: Next<T>) -> ChainResult<T> {
        self.log.push(format!("{}:before", self.name));
        let result = next.run(ctx, request).await;
        self.log.push(format!("{}:after", self.name));
        result
    }
}

/// A middleware that always fails without calling the rest of the chain.
#[derive(Debug)]
pub struct FailingMiddleware {
    name: String,
    message: String,
    calls: AtomicU32,
}

impl FailingMiddleware {
    /// Creates a new failing middleware.
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            calls: AtomicU32::new(0),
        }
    }

    /// Returns how many times the middleware was invoked.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: Payload> Middleware<T> for FailingMiddleware {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, _ctx: &ExecutionContext, _request: T, _next: Next<T>) -> ChainResult<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ChainError::stage(&self.name, &self.message))
    }
}

/// A middleware that fails its first `failures` invocations, then passes
/// through.
#[derive(Debug)]
pub struct FlakyMiddleware {
    name: String,
    failures: u32,
    calls: AtomicU32,
}

impl FlakyMiddleware {
    /// Creates a middleware that fails `failures` times before succeeding.
    #[must_use]
    pub fn new(name: impl Into<String>, failures: u32) -> Self {
        Self {
            name: name.into(),
            failures,
            calls: AtomicU32::new(0),
        }
    }

    /// Returns how many times the middleware was invoked.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: Payload> Middleware<T> for FlakyMiddleware {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, ctx: &ExecutionContext, request: T, next: Next<T>) -> ChainResult<T> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(ChainError::stage(
                &self.name,
                format!("transient failure {call}/{}", self.failures),
            ));
        }
        next.run(ctx, request).await
    }
}

/// A middleware that panics on every call.
#[derive(Debug)]
pub struct PanickingMiddleware {
    name: String,
    message: String,
}

impl PanickingMiddleware {
    /// Creates a new panicking middleware.
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl<T: Payload> Middleware<T> for PanickingMiddleware {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, _ctx: &ExecutionContext, _request: T, _next: Next<T>) -> ChainResult<T> {
        panic!("{}", self.message)
    }
}

/// A middleware that waits before passing control on.
///
/// The wait ends early with a cancellation error if the context fires.
#[derive(Debug)]
pub struct SlowMiddleware {
    name: String,
    delay: Duration,
}

impl SlowMiddleware {
    /// Creates a new slow middleware.
    #[must_use]
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
        }
    }

    /// Creates a slow middleware with delay in milliseconds.
    #[must_use]
    pub fn with_delay_ms(name: impl Into<String>, ms: u64) -> Self {
        Self::new(name, Duration::from_millis(ms))
    }
}

#[async_trait]
impl<T: Payload> Middleware<T> for SlowMiddleware {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, ctx: &ExecutionContext, request: T, next: Next<T>) -> ChainResult<T> {
        tokio::select! {
            () = tokio::time::sleep(self.delay) => next.run(ctx, request).await,
            cause = ctx.done() => Err(cause.into()),
        }
    }
}
