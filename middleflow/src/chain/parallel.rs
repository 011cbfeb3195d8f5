//! Fan-out execution over independent sub-chains.

use super::{Chain, ExecutionConfig};
use crate::context::ExecutionContext;
use crate::errors::{ChainError, ChainResult};
use crate::middleware::{Middleware, Payload};
use crate::observability::MetricsSnapshot;
use crate::resilience::isolate;
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

type Worker<T> = JoinHandle<(usize, ChainResult<T>)>;

fn worker_name(index: usize) -> String {
    format!("parallel chain {index}")
}

/// Runs the same request through every sub-chain concurrently.
///
/// Each sub-chain runs on its own tokio task; a lone sub-chain runs inline.
/// A panic escaping a sub-chain becomes a fault of `parallel chain {index}`.
/// Aggregation:
/// - any error: the first error to arrive (completion order) is returned
/// - otherwise: the lowest-index response that is not absent
/// - otherwise: the original request
///
/// Metrics are the field-wise sum of the sub-chains' metrics. Mutations are
/// broadcast to every sub-chain.
pub struct ParallelChain<T: Payload = serde_json::Value> {
    chains: Vec<Arc<dyn Chain<T>>>,
    config: RwLock<Arc<ExecutionConfig>>,
}

impl<T: Payload> ParallelChain<T> {
    /// Creates a parallel chain over `chains`.
    #[must_use]
    pub fn new(config: ExecutionConfig, chains: Vec<Arc<dyn Chain<T>>>) -> Self {
        Self {
            chains,
            config: RwLock::new(Arc::new(config)),
        }
    }

    /// Returns the sub-chains.
    pub fn chains(&self) -> &[Arc<dyn Chain<T>>] {
        &self.chains
    }

    fn spawn_worker(index: usize, chain: Arc<dyn Chain<T>>, ctx: ExecutionContext, request: T) -> Worker<T> {
        tokio::spawn(async move {
            let stage = worker_name(index);
            (index, isolate(&stage, chain.execute(&ctx, request)).await)
        })
    }

    /// Reports a panic recovered around a sub-chain. Faults raised inside a
    /// sub-chain's own stages arrive wrapped and were reported there.
    fn report_fault(&self, err: &ChainError) {
        let config = self.config();
        if let ChainError::StageFault { stage, message } = err {
            error!(chain = %config.name, stage = %stage, panic = %message, "Recovered panic in parallel worker");
            config.events.try_emit(
                "stage.panic_recovered",
                Some(json!({ "chain": config.name, "stage": stage, "message": message })),
            );
        }
    }
}

impl<T: Payload> std::fmt::Debug for ParallelChain<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelChain")
            .field("name", &self.config.read().name)
            .field("chains", &self.chains)
            .finish()
    }
}

#[async_trait]
impl<T: Payload> Chain<T> for ParallelChain<T> {
    fn name(&self) -> String {
        self.config.read().name.clone()
    }

    async fn execute(&self, ctx: &ExecutionContext, request: T) -> ChainResult<T> {
        match self.chains.as_slice() {
            [] => return Ok(request),
            [only] => {
                let result = isolate(&worker_name(0), only.execute(ctx, request)).await;
                if let Err(err) = &result {
                    self.report_fault(err);
                }
                return result;
            }
            _ => {}
        }

        let mut workers: FuturesUnordered<Worker<T>> = self
            .chains
            .iter()
            .enumerate()
            .map(|(index, chain)| {
                Self::spawn_worker(index, Arc::clone(chain), ctx.clone(), request.clone())
            })
            .collect();

        let mut responses: Vec<Option<T>> = self.chains.iter().map(|_| None).collect();
        let mut first_error: Option<ChainError> = None;

        loop {
            let joined = tokio::select! {
                biased;
                cause = ctx.done() => Err(cause),
                joined = workers.next() => Ok(joined),
            };
            let joined = match joined {
                Ok(Some(joined)) => joined,
                Ok(None) => break,
                Err(cause) => {
                    for worker in workers.iter() {
                        worker.abort();
                    }
                    debug!(chain = %self.name(), cause = %cause, "Parallel execution cancelled");
                    return Err(cause.into());
                }
            };

            let (index, result) = match joined {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    let err = ChainError::StageFault {
                        stage: "parallel chain".to_string(),
                        message: join_err.to_string(),
                    };
                    first_error.get_or_insert(err);
                    continue;
                }
            };
            match result {
                Ok(response) => responses[index] = Some(response),
                Err(err) => {
                    self.report_fault(&err);
                    first_error.get_or_insert(err);
                }
            }
        }

        if let Some(err) = first_error {
            debug!(chain = %self.name(), error = %err, "Parallel execution failed");
            return Err(err);
        }

        Ok(responses
            .into_iter()
            .flatten()
            .find(|response| !response.is_absent())
            .unwrap_or(request))
    }

    fn add_middleware(&self, middleware: Arc<dyn Middleware<T>>) {
        for chain in &self.chains {
            chain.add_middleware(Arc::clone(&middleware));
        }
    }

    fn prepend_middleware(&self, middleware: Arc<dyn Middleware<T>>) {
        for chain in &self.chains {
            chain.prepend_middleware(Arc::clone(&middleware));
        }
    }

    fn clear(&self) {
        for chain in &self.chains {
            chain.clear();
        }
    }

    fn count(&self) -> usize {
        self.chains.iter().map(|chain| chain.count()).sum()
    }

    fn middlewares(&self) -> Vec<Arc<dyn Middleware<T>>> {
        self.chains.iter().flat_map(|chain| chain.middlewares()).collect()
    }

    fn metrics(&self) -> MetricsSnapshot {
        let snapshots: Vec<MetricsSnapshot> = self.chains.iter().map(|chain| chain.metrics()).collect();
        MetricsSnapshot::merged(&snapshots)
    }

    fn config(&self) -> Arc<ExecutionConfig> {
        Arc::clone(&self.config.read())
    }

    fn update_config(&self, config: ExecutionConfig) {
        for chain in &self.chains {
            chain.update_config(config.clone());
        }
        *self.config.write() = Arc::new(config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ExecutionChain;
    use crate::errors::ErrorKind;
    use crate::events::CollectingEventSink;
    use crate::middleware::FnHandler;
    use crate::testing::{
        CallLog, FailingMiddleware, PanickingMiddleware, RecordingMiddleware, SlowMiddleware,
    };
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::time::Duration;

    fn returning(value: Value) -> Arc<dyn Chain> {
        Arc::new(
            ExecutionChain::<Value>::new(ExecutionConfig::new("sub"))
                .with_middleware(Arc::new(RecordingMiddleware::new("sub", CallLog::new())))
                .with_handler(Arc::new(FnHandler::new(move |_ctx, _req: Value| {
                    let value = value.clone();
                    async move { Ok(value) }
                }))),
        )
    }

    fn failing(message: &str) -> Arc<dyn Chain> {
        Arc::new(
            ExecutionChain::<Value>::new(ExecutionConfig::new("sub"))
                .with_middleware(Arc::new(FailingMiddleware::new("fail", message))),
        )
    }

    #[derive(Debug)]
    struct PanickingChain;

    async fn explode() -> ChainResult<Value> {
        panic!("sub-chain blew up")
    }

    #[async_trait]
    impl Chain for PanickingChain {
        fn name(&self) -> String {
            "panicking".to_string()
        }

        async fn execute(&self, _ctx: &ExecutionContext, _request: Value) -> ChainResult<Value> {
            explode().await
        }

        fn add_middleware(&self, _middleware: Arc<dyn Middleware>) {}

        fn prepend_middleware(&self, _middleware: Arc<dyn Middleware>) {}

        fn clear(&self) {}

        fn count(&self) -> usize {
            0
        }

        fn middlewares(&self) -> Vec<Arc<dyn Middleware>> {
            Vec::new()
        }

        fn metrics(&self) -> MetricsSnapshot {
            MetricsSnapshot::default()
        }

        fn config(&self) -> Arc<ExecutionConfig> {
            Arc::new(ExecutionConfig::new("panicking"))
        }

        fn update_config(&self, _config: ExecutionConfig) {}
    }

    #[tokio::test]
    async fn test_no_sub_chains_returns_request() {
        let chain: ParallelChain = ParallelChain::new(ExecutionConfig::new("p"), Vec::new());
        let response = chain
            .execute(&ExecutionContext::background(), json!("req"))
            .await
            .unwrap();
        assert_eq!(response, json!("req"));
    }

    #[tokio::test]
    async fn test_single_sub_chain_delegates() {
        let chain = ParallelChain::new(ExecutionConfig::new("p"), vec![returning(json!("only"))]);
        let response = chain
            .execute(&ExecutionContext::background(), json!("req"))
            .await
            .unwrap();
        assert_eq!(response, json!("only"));
    }

    #[tokio::test]
    async fn test_single_sub_chain_panic_is_contained() {
        let events = Arc::new(CollectingEventSink::new());
        let chain = ParallelChain::new(
            ExecutionConfig::new("p").with_events(events.clone()),
            vec![Arc::new(PanickingChain) as Arc<dyn Chain>],
        );

        let err = chain
            .execute(&ExecutionContext::background(), json!("req"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ChainError::StageFault { ref stage, ref message }
                if stage == "parallel chain 0" && message == "sub-chain blew up"
        ));
        assert_eq!(events.count_of("stage.panic_recovered"), 1);
    }

    #[tokio::test]
    async fn test_sub_chain_stage_panic_reported_once() {
        let events = Arc::new(CollectingEventSink::new());
        let panicking: Arc<dyn Chain> = Arc::new(
            ExecutionChain::<Value>::new(ExecutionConfig::new("sub").with_events(events.clone()))
                .with_middleware(Arc::new(PanickingMiddleware::new("boom", "stage blew up"))),
        );
        let chain = ParallelChain::new(
            ExecutionConfig::new("p").with_events(events.clone()),
            vec![returning(json!(1)), panicking],
        );

        let err = chain
            .execute(&ExecutionContext::background(), json!("req"))
            .await
            .unwrap_err();

        assert!(err.is_fault());
        assert_eq!(err.stage_name(), Some("boom"));
        assert_eq!(events.count_of("stage.panic_recovered"), 1);
    }

    #[tokio::test]
    async fn test_lowest_index_present_response_wins() {
        let chain = ParallelChain::new(
            ExecutionConfig::new("p"),
            vec![returning(Value::Null), returning(json!("v")), returning(json!("w"))],
        );

        let response = chain
            .execute(&ExecutionContext::background(), json!("req"))
            .await
            .unwrap();

        assert_eq!(response, json!("v"));
    }

    #[tokio::test]
    async fn test_all_absent_returns_request() {
        let chain = ParallelChain::new(
            ExecutionConfig::new("p"),
            vec![returning(Value::Null), returning(Value::Null)],
        );

        let response = chain
            .execute(&ExecutionContext::background(), json!("req"))
            .await
            .unwrap();

        assert_eq!(response, json!("req"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_wins_over_faster_successes() {
        let slow_failure: Arc<dyn Chain> = Arc::new(
            ExecutionChain::<Value>::new(ExecutionConfig::new("slow"))
                .with_middleware(Arc::new(SlowMiddleware::new("wait", Duration::from_secs(1))))
                .with_middleware(Arc::new(FailingMiddleware::new("fail", "late failure"))),
        );
        let chain = ParallelChain::new(
            ExecutionConfig::new("p"),
            vec![returning(json!(1)), slow_failure, returning(json!(3))],
        );

        let err = chain
            .execute(&ExecutionContext::background(), json!("req"))
            .await
            .unwrap_err();

        assert_eq!(err.root_cause().kind(), ErrorKind::Stage);
        assert!(err.to_string().contains("late failure"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_error_by_completion_order() {
        let slow_failure: Arc<dyn Chain> = Arc::new(
            ExecutionChain::<Value>::new(ExecutionConfig::new("slow"))
                .with_middleware(Arc::new(SlowMiddleware::new("wait", Duration::from_secs(1))))
                .with_middleware(Arc::new(FailingMiddleware::new("fail", "second"))),
        );
        let chain = ParallelChain::new(ExecutionConfig::new("p"), vec![slow_failure, failing("first")]);

        let err = chain
            .execute(&ExecutionContext::background(), json!("req"))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("first"));
    }

    #[tokio::test]
    async fn test_worker_panic_is_contained() {
        let events = Arc::new(CollectingEventSink::new());
        let chain = ParallelChain::new(
            ExecutionConfig::new("p").with_events(events.clone()),
            vec![returning(json!(1)), Arc::new(PanickingChain) as Arc<dyn Chain>],
        );

        let err = chain
            .execute(&ExecutionContext::background(), json!("req"))
            .await
            .unwrap_err();

        assert!(err.is_fault());
        assert!(err.to_string().contains("parallel chain 1"));
        assert_eq!(events.count_of("stage.panic_recovered"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_rendezvous() {
        let slow: Arc<dyn Chain> = Arc::new(
            ExecutionChain::<Value>::new(ExecutionConfig::new("slow"))
                .with_middleware(Arc::new(SlowMiddleware::new("wait", Duration::from_secs(60)))),
        );
        let chain = ParallelChain::new(ExecutionConfig::new("p"), vec![Arc::clone(&slow), slow]);
        let ctx = ExecutionContext::background().with_timeout(Duration::from_millis(100));

        let err = chain.execute(&ctx, json!("req")).await.unwrap_err();

        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_mutations_broadcast() {
        let first: Arc<ExecutionChain> = Arc::new(ExecutionChain::new(ExecutionConfig::new("a")));
        let second: Arc<ExecutionChain> = Arc::new(ExecutionChain::new(ExecutionConfig::new("b")));
        let chain = ParallelChain::new(
            ExecutionConfig::new("p"),
            vec![first.clone() as Arc<dyn Chain>, second.clone() as Arc<dyn Chain>],
        );

        let log = CallLog::new();
        chain.add_middleware(Arc::new(RecordingMiddleware::new("inner", log.clone())));
        chain.prepend_middleware(Arc::new(RecordingMiddleware::new("outer", log.clone())));

        assert_eq!(first.count(), 2);
        assert_eq!(second.count(), 2);
        assert_eq!(chain.count(), 4);
        assert_eq!(chain.middlewares().len(), 4);

        chain.update_config(ExecutionConfig::new("renamed"));
        assert_eq!(chain.name(), "renamed");
        assert_eq!(first.name(), "renamed");
        assert_eq!(second.config().name, "renamed");

        chain.clear();
        assert_eq!(chain.count(), 0);
    }

    #[tokio::test]
    async fn test_metrics_are_summed() {
        let chain = ParallelChain::new(
            ExecutionConfig::new("p"),
            vec![returning(json!(1)), failing("down"), returning(json!(3))],
        );

        let _ = chain.execute(&ExecutionContext::background(), json!("req")).await;
        let _ = chain.execute(&ExecutionContext::background(), json!("req")).await;

        let metrics = chain.metrics();
        assert_eq!(metrics.executions, 6);
        assert_eq!(metrics.successes, 4);
        assert_eq!(metrics.errors, 2);
    }
}
