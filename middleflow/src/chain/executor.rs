//! Sequential chain executor using Russian-doll nesting.

use super::{Chain, ExecutionConfig};
use crate::context::ExecutionContext;
use crate::errors::{ChainError, ChainResult};
use crate::middleware::{Continuation, Handler, Middleware, Next, Passthrough, Payload};
use crate::observability::{ExecutionOutcome, MetricsRecorder, MetricsSnapshot};
use crate::resilience::{invoke_stage, isolate, StageCall, TraversalState};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error};

const TERMINAL_HANDLER: &str = "terminal handler";

type Stages<T> = Arc<Vec<Arc<dyn Middleware<T>>>>;

struct ChainState<T: Payload> {
    stages: Stages<T>,
    config: Arc<ExecutionConfig>,
}

/// Runs an ordered list of middleware around a terminal handler.
///
/// Stage 0 wraps stage 1, which wraps stage 2, and so on; the handler runs
/// innermost. Each stage call goes through the configured breaker, retry
/// policy, and panic isolation.
///
/// The stage list and config are swapped copy-on-write, so an execution
/// already in flight keeps the snapshot it started with.
pub struct ExecutionChain<T: Payload = serde_json::Value> {
    state: RwLock<ChainState<T>>,
    handler: Arc<dyn Handler<T>>,
    metrics: MetricsRecorder,
}

impl<T: Payload> ExecutionChain<T> {
    /// Creates an empty chain with the given config and a pass-through handler.
    #[must_use]
    pub fn new(config: ExecutionConfig) -> Self {
        Self {
            state: RwLock::new(ChainState {
                stages: Arc::new(Vec::new()),
                config: Arc::new(config),
            }),
            handler: Arc::new(Passthrough),
            metrics: MetricsRecorder::new(),
        }
    }

    /// Sets the terminal handler.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn Handler<T>>) -> Self {
        self.handler = handler;
        self
    }

    /// Appends a middleware and returns `self` for chaining.
    #[must_use]
    pub fn with_middleware(self, middleware: Arc<dyn Middleware<T>>) -> Self {
        self.add_middleware(middleware);
        self
    }

    /// Executes the chain with an explicit terminal handler.
    ///
    /// # Errors
    ///
    /// Returns the first error that propagates out of the traversal, or a
    /// cancellation error if `ctx` fires first.
    pub async fn execute_with(
        &self,
        ctx: &ExecutionContext,
        request: T,
        handler: Arc<dyn Handler<T>>,
    ) -> ChainResult<T> {
        let _in_flight = self.metrics.enter();
        let (stages, config) = {
            let state = self.state.read();
            (Arc::clone(&state.stages), Arc::clone(&state.config))
        };
        let started = config.clock.now();

        if stages.is_empty() {
            debug!(chain = %config.name, "Empty middleware chain, returning request as response");
            self.finish(&config, started, None, false);
            return Ok(request);
        }

        let ctx = match config.timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.clone(),
        };

        let traversal = Arc::new(Traversal {
            stages: Arc::clone(&stages),
            handler,
            config: Arc::clone(&config),
            state: TraversalState::new(),
        });

        let result = tokio::select! {
            biased;
            result = Arc::clone(&traversal).resume(0, ctx.clone(), request) => result,
            cause = ctx.done() => Err(ChainError::from(cause)),
        };

        self.finish(&config, started, result.as_ref().err(), traversal.state.panicked());
        result
    }

    fn finish(
        &self,
        config: &ExecutionConfig,
        started: std::time::Instant,
        failure: Option<&ChainError>,
        panicked: bool,
    ) {
        let duration = config.clock.now().saturating_duration_since(started);
        self.metrics.record(
            duration,
            ExecutionOutcome {
                succeeded: failure.is_none(),
                panicked,
            },
        );

        let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        match failure {
            None => {
                debug!(chain = %config.name, duration_ms, "Executed middleware chain");
                config.events.try_emit(
                    "chain.completed",
                    Some(json!({ "chain": config.name, "duration_ms": duration_ms })),
                );
            }
            Some(err) => {
                error!(chain = %config.name, error = %err, duration_ms, "Error in middleware chain");
                config.events.try_emit(
                    "chain.failed",
                    Some(json!({
                        "chain": config.name,
                        "duration_ms": duration_ms,
                        "panicked": panicked,
                        "error": err.to_dict(),
                    })),
                );
            }
        }
    }

    fn mutate_stages(&self, event: &str, f: impl FnOnce(&mut Vec<Arc<dyn Middleware<T>>>)) {
        let (name, count, config) = {
            let mut state = self.state.write();
            let mut stages = state.stages.as_ref().clone();
            f(&mut stages);
            let count = stages.len();
            state.stages = Arc::new(stages);
            (state.config.name.clone(), count, Arc::clone(&state.config))
        };
        debug!(chain = %name, middleware_count = count, event, "Middleware list changed");
        config.events.try_emit(
            event,
            Some(json!({ "chain": name, "middleware_count": count })),
        );
    }
}

impl<T: Payload> Default for ExecutionChain<T> {
    fn default() -> Self {
        Self::new(ExecutionConfig::default())
    }
}

impl<T: Payload> std::fmt::Debug for ExecutionChain<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("ExecutionChain")
            .field("name", &state.config.name)
            .field("middleware", &state.stages.iter().map(|m| m.name().to_string()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<T: Payload> Chain<T> for ExecutionChain<T> {
    fn name(&self) -> String {
        self.state.read().config.name.clone()
    }

    async fn execute(&self, ctx: &ExecutionContext, request: T) -> ChainResult<T> {
        self.execute_with(ctx, request, Arc::clone(&self.handler)).await
    }

    fn add_middleware(&self, middleware: Arc<dyn Middleware<T>>) {
        self.mutate_stages("chain.middleware_added", |stages| stages.push(middleware));
    }

    fn prepend_middleware(&self, middleware: Arc<dyn Middleware<T>>) {
        self.mutate_stages("chain.middleware_prepended", |stages| {
            stages.insert(0, middleware);
        });
    }

    fn clear(&self) {
        self.mutate_stages("chain.cleared", Vec::clear);
        self.metrics.reset();
    }

    fn count(&self) -> usize {
        self.state.read().stages.len()
    }

    fn middlewares(&self) -> Vec<Arc<dyn Middleware<T>>> {
        self.state.read().stages.as_ref().clone()
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn config(&self) -> Arc<ExecutionConfig> {
        Arc::clone(&self.state.read().config)
    }

    fn update_config(&self, config: ExecutionConfig) {
        let config = Arc::new(config);
        let previous = {
            let mut state = self.state.write();
            std::mem::replace(&mut state.config, Arc::clone(&config))
        };
        debug!(chain = %config.name, previous = %previous.name, "Updated chain config");
        config.events.try_emit(
            "chain.config_updated",
            Some(json!({
                "chain": config.name,
                "timeout_ms": config.timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
                "max_retries": config.retry.max_retries,
                "breaker": config.breaker.as_ref().map(|b| b.name().to_string()),
            })),
        );
    }
}

/// One execution's snapshot of the chain.
struct Traversal<T: Payload> {
    stages: Stages<T>,
    handler: Arc<dyn Handler<T>>,
    config: Arc<ExecutionConfig>,
    state: TraversalState,
}

#[async_trait]
impl<T: Payload> Continuation<T> for Traversal<T> {
    async fn resume(self: Arc<Self>, index: usize, ctx: ExecutionContext, request: T) -> ChainResult<T> {
        if let Some(cause) = ctx.err() {
            return Err(cause.into());
        }

        let Some(stage) = self.stages.get(index).cloned() else {
            return self.call_handler(&ctx, request).await;
        };

        let stage: &dyn Middleware<T> = stage.as_ref();
        let ctx = &ctx;
        let call = StageCall {
            stage: stage.name(),
            index,
            ctx,
            config: &self.config,
            state: &self.state,
        };

        let this = &self;
        let request = &request;
        invoke_stage(call, move || {
            let rest: Arc<dyn Continuation<T>> = Arc::clone(this) as Arc<dyn Continuation<T>>;
            let next = Next::new(rest, index + 1, ctx.clone());
            stage.handle(ctx, request.clone(), next)
        })
        .await
    }
}

impl<T: Payload> Traversal<T> {
    async fn call_handler(&self, ctx: &ExecutionContext, request: T) -> ChainResult<T> {
        let result = isolate(TERMINAL_HANDLER, self.handler.call(ctx, request)).await;
        if let Err(ChainError::StageFault { stage, message }) = &result {
            if stage == TERMINAL_HANDLER {
                self.state.mark_panicked();
                error!(chain = %self.config.name, panic = %message, "Recovered panic in terminal handler");
                self.config.events.try_emit(
                    "stage.panic_recovered",
                    Some(json!({ "chain": self.config.name, "stage": TERMINAL_HANDLER, "message": message })),
                );
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::events::CollectingEventSink;
    use crate::middleware::{FnHandler, FnMiddleware};
    use crate::resilience::RetryPolicy;
    use crate::testing::{CallLog, FailingMiddleware, RecordingMiddleware};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::time::Duration;

    fn tag(name: &'static str) -> Arc<dyn Middleware> {
        Arc::new(FnMiddleware::new(name, move |ctx, req: Value, next: Next| async move {
            let mut path = req.as_array().cloned().unwrap_or_default();
            path.push(json!(name));
            next.run(&ctx, Value::Array(path)).await
        }))
    }

    #[tokio::test]
    async fn test_empty_chain_is_identity() {
        let chain: ExecutionChain = ExecutionChain::new(ExecutionConfig::new("empty"));
        let ctx = ExecutionContext::background();

        let response = chain.execute(&ctx, json!({"id": 9})).await.unwrap();

        assert_eq!(response, json!({"id": 9}));
        assert_eq!(chain.metrics().executions, 1);
    }

    #[tokio::test]
    async fn test_stages_run_in_order_then_handler() {
        let chain = ExecutionChain::new(ExecutionConfig::new("ordered"))
            .with_middleware(tag("a"))
            .with_middleware(tag("b"))
            .with_handler(Arc::new(FnHandler::new(|_ctx, req: Value| async move {
                Ok(json!({ "handled": req }))
            })));

        let response = chain
            .execute(&ExecutionContext::background(), json!([]))
            .await
            .unwrap();

        assert_eq!(response, json!({ "handled": ["a", "b"] }));
    }

    #[tokio::test]
    async fn test_prepend_and_count() {
        let chain: ExecutionChain = ExecutionChain::default();
        chain.add_middleware(tag("b"));
        chain.prepend_middleware(tag("a"));

        assert_eq!(chain.count(), 2);
        let names: Vec<String> = chain.middlewares().iter().map(|m| m.name().to_string()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let response = chain
            .execute(&ExecutionContext::background(), json!([]))
            .await
            .unwrap();
        assert_eq!(response, json!(["a", "b"]));
    }

    #[tokio::test]
    async fn test_clear_resets_stages_and_metrics() {
        let events = Arc::new(CollectingEventSink::new());
        let chain: ExecutionChain =
            ExecutionChain::new(ExecutionConfig::new("c").with_events(events.clone()));
        chain.add_middleware(tag("a"));
        chain.execute(&ExecutionContext::background(), json!([])).await.unwrap();
        assert_eq!(chain.metrics().executions, 1);

        chain.clear();

        assert_eq!(chain.count(), 0);
        assert_eq!(chain.metrics().executions, 0);
        assert_eq!(events.count_of("chain.middleware_added"), 1);
        assert_eq!(events.count_of("chain.cleared"), 1);
    }

    #[tokio::test]
    async fn test_cancelled_context_stops_before_first_stage() {
        let log = CallLog::new();
        let chain: ExecutionChain = ExecutionChain::default()
            .with_middleware(Arc::new(RecordingMiddleware::new("a", log.clone())));
        let (ctx, handle) = ExecutionContext::background().with_cancel();
        handle.cancel();

        let err = chain.execute(&ctx, json!(1)).await.unwrap_err();

        assert!(err.is_cancelled());
        assert!(log.entries().is_empty());
        assert_eq!(chain.metrics().errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chain_timeout_bounds_traversal() {
        let chain: ExecutionChain = ExecutionChain::new(
            ExecutionConfig::new("slow").with_timeout(Duration::from_millis(50)),
        )
        .with_middleware(Arc::new(FnMiddleware::new(
            "sleepy",
            |ctx, req: Value, next: Next| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                next.run(&ctx, req).await
            },
        )));

        let err = chain
            .execute(&ExecutionContext::background(), json!(1))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ChainError::Cancelled(crate::errors::CancelCause::DeadlineExceeded)
        ));
    }

    #[tokio::test]
    async fn test_update_config_applies_to_next_execution() {
        let chain: ExecutionChain = ExecutionChain::default()
            .with_middleware(Arc::new(FailingMiddleware::new("flaky", "down")));
        let err = chain
            .execute(&ExecutionContext::background(), json!(1))
            .await
            .unwrap_err();
        assert_eq!(err.attempts(), Some(1));
        assert_eq!(err.root_cause().kind(), ErrorKind::Stage);

        chain.update_config(
            ExecutionConfig::new("retrying").with_retry(
                RetryPolicy::new(1).with_backoff(|_| Duration::ZERO),
            ),
        );

        let err = chain
            .execute(&ExecutionContext::background(), json!(1))
            .await
            .unwrap_err();
        assert_eq!(err.attempts(), Some(2));
        assert_eq!(chain.name(), "retrying");
        assert_eq!(chain.config().retry.max_retries, 1);
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let chain = ExecutionChain::default()
            .with_middleware(tag("a"))
            .with_handler(Arc::new(FnHandler::new(|_ctx, _req: Value| async move {
                if true {
                    panic!("handler exploded");
                }
                Ok(Value::Null)
            })));

        let err = chain
            .execute(&ExecutionContext::background(), json!([]))
            .await
            .unwrap_err();

        assert!(err.is_fault());
        assert!(err.to_string().contains("terminal handler"));
        assert_eq!(chain.metrics().panics, 1);
    }

    #[tokio::test]
    async fn test_execute_with_overrides_handler() {
        let chain: ExecutionChain = ExecutionChain::default().with_middleware(tag("a"));
        let handler = Arc::new(FnHandler::new(|_ctx, req: Value| async move {
            Ok(json!({ "override": req }))
        }));

        let response = chain
            .execute_with(&ExecutionContext::background(), json!([]), handler)
            .await
            .unwrap();

        assert_eq!(response, json!({ "override": ["a"] }));
    }

    #[tokio::test]
    async fn test_completion_events() {
        let events = Arc::new(CollectingEventSink::new());
        let chain: ExecutionChain =
            ExecutionChain::new(ExecutionConfig::new("evented").with_events(events.clone()))
                .with_middleware(tag("a"));

        chain.execute(&ExecutionContext::background(), json!([])).await.unwrap();

        assert_eq!(events.count_of("chain.completed"), 1);
        assert_eq!(events.count_of("chain.failed"), 0);
    }
}
