//! The continuation handed to each stage.

use super::{Handler, Payload};
use crate::context::ExecutionContext;
use crate::errors::ChainResult;
use async_trait::async_trait;
use std::sync::Arc;

/// Resumes a traversal at a given stage index.
#[async_trait]
pub(crate) trait Continuation<T: Payload>: Send + Sync {
    async fn resume(self: Arc<Self>, index: usize, ctx: ExecutionContext, request: T) -> ChainResult<T>;
}

/// Runs the remainder of the chain.
///
/// Calling [`Next::run`] more than once re-runs the downstream stages;
/// ordering and metrics assume at most one call per request.
pub struct Next<T: Payload = serde_json::Value> {
    rest: Arc<dyn Continuation<T>>,
    index: usize,
    tracked: ExecutionContext,
}

impl<T: Payload> Clone for Next<T> {
    fn clone(&self) -> Self {
        Self {
            rest: Arc::clone(&self.rest),
            index: self.index,
            tracked: self.tracked.clone(),
        }
    }
}

impl<T: Payload> Next<T> {
    pub(crate) fn new(rest: Arc<dyn Continuation<T>>, index: usize, tracked: ExecutionContext) -> Self {
        Self {
            rest,
            index,
            tracked,
        }
    }

    /// Creates a continuation that calls `handler` directly.
    ///
    /// Useful for driving a single middleware outside a chain.
    #[must_use]
    pub fn from_handler(ctx: &ExecutionContext, handler: Arc<dyn Handler<T>>) -> Self {
        Self::new(Arc::new(HandlerContinuation { handler }), 0, ctx.clone())
    }

    /// Passes control to the next stage.
    ///
    /// If `ctx` is not the context this stage received, it is adopted for the
    /// rest of the traversal but still fires when the received one does.
    ///
    /// # Errors
    ///
    /// Returns whatever the downstream stages or the handler return.
    pub async fn run(&self, ctx: &ExecutionContext, request: T) -> ChainResult<T> {
        let ctx = if ctx.same_as(&self.tracked) {
            ctx.clone()
        } else {
            ctx.guarded_by(&self.tracked)
        };
        Arc::clone(&self.rest).resume(self.index, ctx, request).await
    }

    /// Returns the context the current stage was invoked with.
    #[must_use]
    pub fn context(&self) -> &ExecutionContext {
        &self.tracked
    }
}

impl<T: Payload> std::fmt::Debug for Next<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next").field("index", &self.index).finish_non_exhaustive()
    }
}

struct HandlerContinuation<T: Payload> {
    handler: Arc<dyn Handler<T>>,
}

#[async_trait]
impl<T: Payload> Continuation<T> for HandlerContinuation<T> {
    async fn resume(self: Arc<Self>, _index: usize, ctx: ExecutionContext, request: T) -> ChainResult<T> {
        self.handler.call(&ctx, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::FnHandler;
    use serde_json::json;

    #[tokio::test]
    async fn test_from_handler_runs_handler() {
        let ctx = ExecutionContext::background();
        let handler = Arc::new(FnHandler::new(|_ctx, req: serde_json::Value| async move {
            Ok(json!({ "echo": req }))
        }));

        let next = Next::from_handler(&ctx, handler);
        let response = next.run(&ctx, json!(1)).await.unwrap();

        assert_eq!(response, json!({ "echo": 1 }));
    }

    #[tokio::test]
    async fn test_swapped_context_keeps_parent_signal() {
        let (ctx, handle) = ExecutionContext::background().with_cancel();
        let handler = Arc::new(FnHandler::new(|ctx: ExecutionContext, req: serde_json::Value| async move {
            handle_err(&ctx)?;
            Ok(req)
        }));
        let next = Next::from_handler(&ctx, handler);

        handle.cancel();
        let unrelated = ExecutionContext::background();
        let err = next.run(&unrelated, json!(null)).await.unwrap_err();

        assert!(err.is_cancelled());
    }

    fn handle_err(ctx: &ExecutionContext) -> ChainResult<()> {
        match ctx.err() {
            Some(cause) => Err(cause.into()),
            None => Ok(()),
        }
    }
}
