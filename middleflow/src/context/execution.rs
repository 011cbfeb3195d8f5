//! Execution context carrying cancellation, deadline, and metadata.
//!
//! An [`ExecutionContext`] is a cheap handle (`Arc` inside). Deriving a
//! context with [`ExecutionContext::with_cancel`] or
//! [`ExecutionContext::with_timeout`] produces a child whose signal fires
//! when the parent's does, but never the other way round.

use super::bags::MetadataBag;
use crate::errors::CancelCause;
use crate::utils::Timestamp;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct ContextInner {
    token: CancellationToken,
    /// Tokens of contexts this one was adopted under.
    watched: Vec<CancellationToken>,
    deadline: Option<Instant>,
    metadata: Arc<MetadataBag>,
    created_at: std::time::Instant,
    created_at_utc: Timestamp,
    id: Option<String>,
}

/// Cancellation, deadline, and metadata for one request traversal.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

/// Cancels the context it was created with, and all contexts derived from it.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Fires the signal. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns true once [`CancelHandle::cancel`] has been called or a parent fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl ExecutionContext {
    /// Creates a root context that is never cancelled on its own.
    #[must_use]
    pub fn background() -> Self {
        Self::from_token(CancellationToken::new())
    }

    /// Creates a root context driven by an existing cancellation token.
    #[must_use]
    pub fn from_token(token: CancellationToken) -> Self {
        Self::build(ContextInner {
            token,
            watched: Vec::new(),
            deadline: None,
            metadata: Arc::new(MetadataBag::new()),
            created_at: std::time::Instant::now(),
            created_at_utc: chrono::Utc::now(),
            id: None,
        })
    }

    /// Creates a context with its own metadata for the context manager.
    pub(crate) fn tracked(
        parent: &Self,
        id: Option<String>,
        metadata: HashMap<String, serde_json::Value>,
        created_at: std::time::Instant,
    ) -> Self {
        Self::build(ContextInner {
            token: parent.inner.token.child_token(),
            watched: parent.inner.watched.clone(),
            deadline: parent.inner.deadline,
            metadata: Arc::new(MetadataBag::from_data(metadata)),
            created_at,
            created_at_utc: chrono::Utc::now(),
            id,
        })
    }

    fn build(inner: ContextInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    fn derive(&self, deadline: Option<Instant>) -> Self {
        let deadline = match (self.inner.deadline, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self::build(ContextInner {
            token: self.inner.token.child_token(),
            watched: self.inner.watched.clone(),
            deadline,
            metadata: Arc::clone(&self.inner.metadata),
            created_at: self.inner.created_at,
            created_at_utc: self.inner.created_at_utc,
            id: self.inner.id.clone(),
        })
    }

    /// Derives a child context plus a handle that cancels it.
    #[must_use]
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let child = self.derive(None);
        let handle = CancelHandle {
            token: child.inner.token.clone(),
        };
        (child, handle)
    }

    /// Derives a child context whose deadline is at most `timeout` from now.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.derive(Some(Instant::now() + timeout))
    }

    /// Derives a child context with the given deadline (the earlier one wins).
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        self.derive(Some(deadline))
    }

    /// Returns a copy of `self` that additionally fires when `guard` fires.
    ///
    /// Used when a stage hands an unrelated context downstream: the guard's
    /// cancellation and deadline keep applying to the rest of the traversal.
    #[must_use]
    pub fn guarded_by(&self, guard: &Self) -> Self {
        let mut watched = self.inner.watched.clone();
        watched.push(guard.inner.token.clone());
        watched.extend(guard.inner.watched.iter().cloned());
        let deadline = match (self.inner.deadline, guard.inner.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self::build(ContextInner {
            token: self.inner.token.clone(),
            watched,
            deadline,
            metadata: Arc::clone(&self.inner.metadata),
            created_at: self.inner.created_at,
            created_at_utc: self.inner.created_at_utc,
            id: self.inner.id.clone(),
        })
    }

    /// Returns true if both handles refer to the same context.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns why the context fired, or `None` while it is live.
    #[must_use]
    pub fn err(&self) -> Option<CancelCause> {
        if self.inner.token.is_cancelled()
            || self.inner.watched.iter().any(CancellationToken::is_cancelled)
        {
            return Some(CancelCause::Cancelled);
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelCause::DeadlineExceeded),
            _ => None,
        }
    }

    /// Returns true once the context has fired.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves when the context fires.
    pub async fn done(&self) -> CancelCause {
        if let Some(cause) = self.err() {
            return cause;
        }

        let cancelled = async {
            if self.inner.watched.is_empty() {
                self.inner.token.cancelled().await;
            } else {
                let waits = std::iter::once(&self.inner.token)
                    .chain(self.inner.watched.iter())
                    .map(|token| Box::pin(token.cancelled()));
                futures::future::select_all(waits).await;
            }
            CancelCause::Cancelled
        };

        match self.inner.deadline {
            Some(deadline) => tokio::select! {
                cause = cancelled => cause,
                () = tokio::time::sleep_until(deadline) => CancelCause::DeadlineExceeded,
            },
            None => cancelled.await,
        }
    }

    /// Returns the deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Returns the time left before the deadline, if any.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Returns the shared metadata bag.
    #[must_use]
    pub fn metadata(&self) -> &MetadataBag {
        &self.inner.metadata
    }

    /// Sets a metadata value and returns `self` for chaining.
    #[must_use]
    pub fn with_value(self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.inner.metadata.set(key, value);
        self
    }

    /// Returns the tracking identifier, if the context came from a manager.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.inner.id.as_deref()
    }

    /// Returns the monotonic creation instant.
    #[must_use]
    pub fn created_at(&self) -> std::time::Instant {
        self.inner.created_at
    }

    /// Returns the wall-clock creation timestamp.
    #[must_use]
    pub fn created_at_utc(&self) -> Timestamp {
        self.inner.created_at_utc
    }

    /// Takes the metadata map back if no other handle shares this context.
    pub(crate) fn into_metadata(self) -> Option<HashMap<String, serde_json::Value>> {
        let inner = Arc::try_unwrap(self.inner).ok()?;
        let bag = Arc::try_unwrap(inner.metadata).ok()?;
        Some(bag.into_inner())
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::background()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.inner.id)
            .field("done", &self.err())
            .field("deadline", &self.inner.deadline)
            .field("metadata_keys", &self.inner.metadata.len())
            .field("created_at", &self.inner.created_at_utc.to_rfc3339())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_background_is_live() {
        let ctx = ExecutionContext::background();
        assert!(ctx.err().is_none());
        assert!(ctx.id().is_none());
        assert!(ctx.deadline().is_none());
    }

    #[test]
    fn test_cancel_propagates_to_children_only() {
        let root = ExecutionContext::background();
        let (parent, parent_handle) = root.with_cancel();
        let (child, child_handle) = parent.with_cancel();

        child_handle.cancel();
        assert_eq!(child.err(), Some(CancelCause::Cancelled));
        assert!(parent.err().is_none());

        parent_handle.cancel();
        assert_eq!(parent.err(), Some(CancelCause::Cancelled));
        assert!(root.err().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_deadline_exceeded() {
        let ctx = ExecutionContext::background().with_timeout(Duration::from_millis(50));
        assert!(ctx.err().is_none());

        let cause = ctx.done().await;
        assert_eq!(cause, CancelCause::DeadlineExceeded);
        assert_eq!(ctx.err(), Some(CancelCause::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_deadline_wins() {
        let outer = ExecutionContext::background().with_timeout(Duration::from_millis(10));
        let inner = outer.with_timeout(Duration::from_secs(60));
        assert_eq!(inner.deadline(), outer.deadline());
    }

    #[tokio::test]
    async fn test_guarded_context_observes_guard() {
        let (guard, handle) = ExecutionContext::background().with_cancel();
        let unrelated = ExecutionContext::background();
        let adopted = unrelated.guarded_by(&guard);

        assert!(adopted.err().is_none());
        handle.cancel();
        assert_eq!(adopted.done().await, CancelCause::Cancelled);
        assert!(unrelated.err().is_none());
    }

    #[test]
    fn test_metadata_shared_with_derived() {
        let root = ExecutionContext::background().with_value("tenant", json!("acme"));
        let (child, _handle) = root.with_cancel();

        child.metadata().set("trace", json!("abc"));
        assert_eq!(root.metadata().get("trace"), Some(json!("abc")));
        assert_eq!(child.metadata().get("tenant"), Some(json!("acme")));
    }

    #[test]
    fn test_same_as() {
        let ctx = ExecutionContext::background();
        let copy = ctx.clone();
        let (child, _handle) = ctx.with_cancel();

        assert!(ctx.same_as(&copy));
        assert!(!ctx.same_as(&child));
    }

    #[test]
    fn test_into_metadata_requires_exclusive_ownership() {
        let root = ExecutionContext::background();
        let tracked = ExecutionContext::tracked(
            &root,
            Some("ctx_1".to_string()),
            HashMap::from([("k".to_string(), json!(1))]),
            std::time::Instant::now(),
        );

        let shared = tracked.clone();
        assert!(tracked.into_metadata().is_none());

        let map = shared.into_metadata().unwrap();
        assert_eq!(map.get("k"), Some(&json!(1)));
    }
}
