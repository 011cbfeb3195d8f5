//! Middleware and handler traits.
//!
//! A middleware is one stage of a chain. It receives the context, the
//! request, and a [`Next`] continuation; whatever it does before calling
//! `next.run(..)` happens on the way in, whatever it does afterwards happens
//! on the way out.

mod next;
mod payload;

pub use next::Next;
pub(crate) use next::Continuation;
pub use payload::Payload;

use crate::context::ExecutionContext;
use crate::errors::ChainResult;
use async_trait::async_trait;
use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;

/// Trait for chain stages.
#[async_trait]
pub trait Middleware<T: Payload = serde_json::Value>: Send + Sync + Debug {
    /// Returns the name of the middleware.
    fn name(&self) -> &str;

    /// Handles a request.
    ///
    /// # Arguments
    ///
    /// * `ctx` - The execution context for this traversal
    /// * `request` - The incoming request
    /// * `next` - Continuation running the rest of the chain
    async fn handle(&self, ctx: &ExecutionContext, request: T, next: Next<T>) -> ChainResult<T>;
}

/// Terminal handler invoked once the stage list is exhausted.
#[async_trait]
pub trait Handler<T: Payload = serde_json::Value>: Send + Sync + Debug {
    /// Produces the response for a request.
    async fn call(&self, ctx: &ExecutionContext, request: T) -> ChainResult<T>;
}

/// Handler that returns the request unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

#[async_trait]
impl<T: Payload> Handler<T> for Passthrough {
    async fn call(&self, _ctx: &ExecutionContext, request: T) -> ChainResult<T> {
        Ok(request)
    }
}

/// An async function-based middleware.
pub struct FnMiddleware<F, Fut> {
    name: String,
    func: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnMiddleware<F, Fut> {
    /// Creates a new function-based middleware.
    pub fn new<T>(name: impl Into<String>, func: F) -> Self
    where
        T: Payload,
        F: Fn(ExecutionContext, T, Next<T>) -> Fut + Send + Sync,
        Fut: Future<Output = ChainResult<T>> + Send,
    {
        Self {
            name: name.into(),
            func,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> Debug for FnMiddleware<F, Fut> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnMiddleware")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl<T, F, Fut> Middleware<T> for FnMiddleware<F, Fut>
where
    T: Payload,
    F: Fn(ExecutionContext, T, Next<T>) -> Fut + Send + Sync,
    Fut: Future<Output = ChainResult<T>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, ctx: &ExecutionContext, request: T, next: Next<T>) -> ChainResult<T> {
        (self.func)(ctx.clone(), request, next).await
    }
}

/// An async function-based terminal handler.
pub struct FnHandler<F, Fut> {
    func: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut> {
    /// Creates a new function-based handler.
    pub fn new<T>(func: F) -> Self
    where
        T: Payload,
        F: Fn(ExecutionContext, T) -> Fut + Send + Sync,
        Fut: Future<Output = ChainResult<T>> + Send,
    {
        Self {
            func,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> Debug for FnHandler<F, Fut> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

#[async_trait]
impl<T, F, Fut> Handler<T> for FnHandler<F, Fut>
where
    T: Payload,
    F: Fn(ExecutionContext, T) -> Fut + Send + Sync,
    Fut: Future<Output = ChainResult<T>> + Send,
{
    async fn call(&self, ctx: &ExecutionContext, request: T) -> ChainResult<T> {
        (self.func)(ctx.clone(), request).await
    }
}
