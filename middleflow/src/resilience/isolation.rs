//! Panic isolation for stage calls.

use crate::errors::{ChainError, ChainResult};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

/// Describes a panic payload.
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(err) = payload.downcast_ref::<ChainError>() {
        err.to_string()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Polls `future` to completion, returning the panic message if it panicked.
pub async fn catch_panic<F: Future>(future: F) -> Result<F::Output, String> {
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(|payload| panic_message(payload.as_ref()))
}

/// Polls `future` to completion, converting a panic into [`ChainError::StageFault`].
///
/// The panic never unwinds past this call.
pub async fn isolate<T, F>(stage: &str, future: F) -> ChainResult<T>
where
    F: Future<Output = ChainResult<T>>,
{
    match catch_panic(future).await {
        Ok(result) => result,
        Err(message) => Err(ChainError::StageFault {
            stage: stage.to_string(),
            message,
        }),
    }
}
