//! Per-stage invocation: breaker gate, backoff, isolated call, retry decision.

use super::isolation::catch_panic;
use crate::chain::ExecutionConfig;
use crate::context::ExecutionContext;
use crate::errors::{ChainError, ChainResult};
use serde_json::json;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, error, warn};

const NO_FAILURE: usize = usize::MAX;

/// State shared by every stage call of one traversal.
#[derive(Debug)]
pub(crate) struct TraversalState {
    panicked: AtomicBool,
    /// Index of the stage whose own failure is currently propagating.
    failure_origin: AtomicUsize,
}

impl TraversalState {
    pub(crate) fn new() -> Self {
        Self {
            panicked: AtomicBool::new(false),
            failure_origin: AtomicUsize::new(NO_FAILURE),
        }
    }

    pub(crate) fn panicked(&self) -> bool {
        self.panicked.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_panicked(&self) {
        self.panicked.store(true, Ordering::SeqCst);
    }

    fn propagated_from_below(&self, index: usize) -> bool {
        let origin = self.failure_origin.load(Ordering::SeqCst);
        origin != NO_FAILURE && origin > index
    }
}

/// Identifies one stage call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StageCall<'a> {
    pub stage: &'a str,
    pub index: usize,
    pub ctx: &'a ExecutionContext,
    pub config: &'a ExecutionConfig,
    pub state: &'a TraversalState,
}

/// Runs one stage under the chain's breaker and retry policy.
///
/// `attempt` is invoked once per attempt. A failure is accounted (breaker,
/// retries) only at the stage where it originated; callers further out see
/// the same error propagate unchanged.
pub(crate) async fn invoke_stage<T, F, Fut>(call: StageCall<'_>, mut attempt: F) -> ChainResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ChainResult<T>>,
{
    let config = call.config;
    let policy = &config.retry;
    let breaker = config.breaker.as_deref();
    let mut attempts = 0;

    loop {
        if let Some(breaker) = breaker {
            if breaker.is_open() {
                debug!(stage = call.stage, breaker = breaker.name(), "Circuit breaker rejected call");
                config.events.try_emit(
                    "breaker.rejected",
                    Some(json!({ "chain": config.name, "stage": call.stage, "breaker": breaker.name() })),
                );
                return Err(ChainError::CircuitOpen {
                    breaker: breaker.name().to_string(),
                });
            }
        }

        if attempts > 0 {
            let delay = policy.delay_for(attempts);
            tokio::select! {
                () = config.clock.sleep(delay) => {}
                cause = call.ctx.done() => return Err(cause.into()),
            }
        }

        attempts += 1;
        call.state.failure_origin.store(NO_FAILURE, Ordering::SeqCst);

        let err = match catch_panic(attempt()).await {
            Ok(Ok(response)) => {
                if let Some(breaker) = breaker {
                    breaker.record_success();
                }
                return Ok(response);
            }
            Ok(Err(err)) => {
                if call.state.propagated_from_below(call.index) || err.is_cancelled() {
                    return Err(err);
                }
                err
            }
            Err(message) => {
                call.state.mark_panicked();
                error!(stage = call.stage, panic = %message, "Recovered panic in middleware");
                config.events.try_emit(
                    "stage.panic_recovered",
                    Some(json!({ "chain": config.name, "stage": call.stage, "message": message })),
                );
                ChainError::StageFault {
                    stage: call.stage.to_string(),
                    message,
                }
            }
        };

        call.state.failure_origin.store(call.index, Ordering::SeqCst);
        if let Some(breaker) = breaker {
            breaker.record_failure();
        }

        if !policy.is_retryable(&err) || attempts > policy.max_retries {
            return Err(ChainError::RetriesExhausted {
                stage: call.stage.to_string(),
                attempts,
                source: Box::new(err),
            });
        }

        warn!(
            stage = call.stage,
            attempt = attempts,
            max_attempts = policy.max_attempts(),
            error = %err,
            "Retrying middleware after error"
        );
        config.events.try_emit(
            "stage.retry_scheduled",
            Some(json!({
                "chain": config.name,
                "stage": call.stage,
                "attempt": attempts,
                "error": err.to_dict(),
            })),
        );
    }
}
