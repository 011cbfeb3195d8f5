//! Tracking, expiry, and pooling of live execution contexts.
//!
//! Both managers implement [`ContextLifecycle`] directly. They share the
//! tracked-context registry and the background sweep, and differ only in
//! where metadata maps come from and where they go on removal.

use super::execution::ExecutionContext;
use super::pool::MetadataPool;
use crate::errors::{ChainError, ChainResult};
use crate::events::{EventSink, NoOpEventSink};
use crate::utils::{generate_context_id, Clock, TokioClock};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type Metadata = HashMap<String, serde_json::Value>;

/// Lower bound on the sweep period; `tokio::time::interval` rejects zero.
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(1);

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Configuration for a context manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextManagerConfig {
    /// Maximum age of a tracked context. `None` disables expiry by age.
    pub ttl: Option<Duration>,
    /// Whether to run the background sweep every `ttl / 2`.
    pub sweep: bool,
    /// Maximum number of idle metadata maps kept by the pooled manager.
    pub pool_capacity: usize,
}

impl Default for ContextManagerConfig {
    fn default() -> Self {
        Self {
            ttl: Some(Duration::from_secs(300)),
            sweep: true,
            pool_capacity: 128,
        }
    }
}

impl ContextManagerConfig {
    /// Creates a config with the given TTL and the sweep enabled.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }

    /// Disables the background sweep; expiry then only happens on explicit cleanup.
    #[must_use]
    pub fn without_sweep(mut self) -> Self {
        self.sweep = false;
        self
    }

    /// Sets the pool capacity.
    #[must_use]
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }
}

/// Point-in-time statistics for a context manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextStats {
    /// Number of tracked contexts.
    pub active_contexts: usize,
    /// Configured TTL in milliseconds.
    pub ttl_ms: Option<u64>,
    /// Whether a background sweep is running.
    pub cleanup_enabled: bool,
    /// Idle metadata maps (pooled manager only).
    pub pool_size: Option<usize>,
    /// Pool capacity (pooled manager only).
    pub pool_capacity: Option<usize>,
}

/// Lifecycle operations shared by every context manager.
#[async_trait]
pub trait ContextLifecycle: Send + Sync {
    /// Creates and tracks a context derived from `parent` under a fresh identifier.
    fn create_context(&self, parent: &ExecutionContext, metadata: Metadata) -> ExecutionContext {
        self.create_context_with_id(parent, &generate_context_id(), metadata)
    }

    /// Creates a context under `id`. An empty `id` yields an untracked context.
    fn create_context_with_id(
        &self,
        parent: &ExecutionContext,
        id: &str,
        metadata: Metadata,
    ) -> ExecutionContext;

    /// Looks up a tracked context.
    fn get_context(&self, id: &str) -> Option<ExecutionContext>;

    /// Merges `delta` into a tracked context's metadata.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::NotFound`] if `id` is not tracked.
    fn update_context(&self, id: &str, delta: Metadata) -> ChainResult<()>;

    /// Stops tracking a context. Returns false if it was not tracked.
    fn remove_context(&self, id: &str) -> bool;

    /// Removes expired or cancelled contexts and returns how many were removed.
    fn cleanup_expired_contexts(&self) -> usize;

    /// Returns the number of tracked contexts.
    fn active_contexts(&self) -> usize;

    /// Returns current statistics.
    fn stats(&self) -> ContextStats;

    /// Stops the background sweep, waits for it, and clears the registry.
    async fn shutdown(&self);

    /// Derives a cancellable child of `parent`.
    fn with_cancel(&self, parent: &ExecutionContext) -> (ExecutionContext, super::CancelHandle) {
        parent.with_cancel()
    }

    /// Derives a child of `parent` bounded by `timeout`.
    fn with_timeout(&self, parent: &ExecutionContext, timeout: Duration) -> ExecutionContext {
        parent.with_timeout(timeout)
    }

    /// Derives a child of `parent` bounded by `deadline`.
    fn with_deadline(
        &self,
        parent: &ExecutionContext,
        deadline: tokio::time::Instant,
    ) -> ExecutionContext {
        parent.with_deadline(deadline)
    }
}

/// Registry of tracked contexts, shared with the sweep task.
#[derive(Debug)]
struct ContextRegistry {
    contexts: RwLock<HashMap<String, ExecutionContext>>,
    ttl: Option<Duration>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl ContextRegistry {
    fn insert(&self, ctx: ExecutionContext) {
        let Some(id) = ctx.id().map(str::to_string) else {
            return;
        };
        let total = {
            let mut contexts = self.contexts.write();
            contexts.insert(id.clone(), ctx);
            contexts.len()
        };
        debug!(context_id = %id, total_contexts = total, "Created and stored context");
        self.events.try_emit(
            "context.created",
            Some(serde_json::json!({ "context_id": id, "total_contexts": total })),
        );
    }

    fn get(&self, id: &str) -> Option<ExecutionContext> {
        self.contexts.read().get(id).cloned()
    }

    fn update(&self, id: &str, delta: Metadata) -> ChainResult<()> {
        let contexts = self.contexts.read();
        let ctx = contexts.get(id).ok_or_else(|| ChainError::not_found(id))?;
        let keys = delta.len();
        ctx.metadata().merge(delta);
        debug!(context_id = %id, metadata_keys = keys, "Updated context metadata");
        Ok(())
    }

    fn remove(&self, id: &str) -> Option<ExecutionContext> {
        let (removed, remaining) = {
            let mut contexts = self.contexts.write();
            let removed = contexts.remove(id);
            (removed, contexts.len())
        };
        if removed.is_some() {
            debug!(context_id = %id, remaining_contexts = remaining, "Removed context");
            self.events.try_emit(
                "context.removed",
                Some(serde_json::json!({ "context_id": id, "remaining_contexts": remaining })),
            );
        }
        removed
    }

    fn is_expired(&self, ctx: &ExecutionContext, now: std::time::Instant) -> bool {
        let aged_out = self
            .ttl
            .is_some_and(|ttl| now.saturating_duration_since(ctx.created_at()) > ttl);
        aged_out || ctx.is_done()
    }

    /// Removes every expired entry in one pass and returns them.
    fn sweep(&self) -> Vec<ExecutionContext> {
        let now = self.clock.now();
        let (expired, remaining) = {
            let mut contexts = self.contexts.write();
            let ids: Vec<String> = contexts
                .iter()
                .filter(|(_, ctx)| self.is_expired(ctx, now))
                .map(|(id, _)| id.clone())
                .collect();
            let expired: Vec<ExecutionContext> =
                ids.iter().filter_map(|id| contexts.remove(id)).collect();
            (expired, contexts.len())
        };

        if !expired.is_empty() {
            debug!(
                expired_count = expired.len(),
                remaining_contexts = remaining,
                "Cleaned up expired contexts"
            );
            self.events.try_emit(
                "context.expired",
                Some(serde_json::json!({
                    "expired_count": expired.len(),
                    "remaining_contexts": remaining,
                })),
            );
        }
        expired
    }

    fn len(&self) -> usize {
        self.contexts.read().len()
    }

    fn drain(&self) -> Vec<ExecutionContext> {
        self.contexts.write().drain().map(|(_, ctx)| ctx).collect()
    }
}

/// Background task that periodically sweeps a registry.
#[derive(Debug)]
struct SweepTask {
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SweepTask {
    fn start(
        registry: &Arc<ContextRegistry>,
        period: Duration,
        on_expired: impl Fn(Vec<ExecutionContext>) + Send + 'static,
    ) -> Option<Self> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime; context sweep disabled");
            return None;
        };

        let token = CancellationToken::new();
        let weak: Weak<ContextRegistry> = Arc::downgrade(registry);
        let stop = token.clone();
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(registry) = weak.upgrade() else { break };
                        on_expired(registry.sweep());
                    }
                }
            }
        });

        debug!(period_ms = duration_ms(period), "Started context sweep");
        Some(Self {
            token,
            handle: Mutex::new(Some(handle)),
        })
    }

    async fn stop(&self) {
        self.token.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Context sweep task ended abnormally");
            }
        }
    }
}

impl Drop for SweepTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Shared state behind both manager variants.
#[derive(Debug)]
struct ManagerCore {
    registry: Arc<ContextRegistry>,
    sweep: Option<SweepTask>,
    stopped: AtomicBool,
}

impl ManagerCore {
    fn new(
        config: &ContextManagerConfig,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        on_expired: impl Fn(Vec<ExecutionContext>) + Send + 'static,
    ) -> Self {
        let registry = Arc::new(ContextRegistry {
            contexts: RwLock::new(HashMap::new()),
            ttl: config.ttl,
            clock,
            events,
        });

        let sweep = match config.ttl {
            Some(ttl) if config.sweep && !ttl.is_zero() => {
                SweepTask::start(&registry, (ttl / 2).max(MIN_SWEEP_PERIOD), on_expired)
            }
            _ => None,
        };

        Self {
            registry,
            sweep,
            stopped: AtomicBool::new(false),
        }
    }

    fn stats(&self) -> ContextStats {
        ContextStats {
            active_contexts: self.registry.len(),
            ttl_ms: self.registry.ttl.map(duration_ms),
            cleanup_enabled: self.sweep.is_some(),
            pool_size: None,
            pool_capacity: None,
        }
    }

    async fn shutdown(&self) -> Vec<ExecutionContext> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }
        if let Some(sweep) = &self.sweep {
            sweep.stop().await;
        }
        let cleared = self.registry.drain();
        debug!(cleared_contexts = cleared.len(), "Context manager shutdown");
        cleared
    }
}

/// Context manager that allocates fresh metadata for every context.
#[derive(Debug)]
pub struct ContextManager {
    core: ManagerCore,
}

impl ContextManager {
    /// Creates a manager on the tokio clock with no event sink.
    #[must_use]
    pub fn new(config: ContextManagerConfig) -> Self {
        Self::with_parts(config, Arc::new(TokioClock), Arc::new(NoOpEventSink))
    }

    /// Creates a manager with an explicit clock and event sink.
    #[must_use]
    pub fn with_parts(
        config: ContextManagerConfig,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            core: ManagerCore::new(&config, clock, events, drop),
        }
    }
}

#[async_trait]
impl ContextLifecycle for ContextManager {
    fn create_context_with_id(
        &self,
        parent: &ExecutionContext,
        id: &str,
        metadata: Metadata,
    ) -> ExecutionContext {
        let registry = &self.core.registry;
        let now = registry.clock.now();
        if id.is_empty() {
            return ExecutionContext::tracked(parent, None, metadata, now);
        }
        let ctx = ExecutionContext::tracked(parent, Some(id.to_string()), metadata, now);
        registry.insert(ctx.clone());
        ctx
    }

    fn get_context(&self, id: &str) -> Option<ExecutionContext> {
        self.core.registry.get(id)
    }

    fn update_context(&self, id: &str, delta: Metadata) -> ChainResult<()> {
        self.core.registry.update(id, delta)
    }

    fn remove_context(&self, id: &str) -> bool {
        self.core.registry.remove(id).is_some()
    }

    fn cleanup_expired_contexts(&self) -> usize {
        self.core.registry.sweep().len()
    }

    fn active_contexts(&self) -> usize {
        self.core.registry.len()
    }

    fn stats(&self) -> ContextStats {
        self.core.stats()
    }

    async fn shutdown(&self) {
        self.core.shutdown().await;
    }
}

/// Context manager that recycles metadata maps through a bounded pool.
///
/// A map is recycled only when the manager holds the last handle to its
/// context; a context still referenced elsewhere is simply dropped.
#[derive(Debug)]
pub struct PooledContextManager {
    core: ManagerCore,
    pool: Arc<MetadataPool>,
}

impl PooledContextManager {
    /// Creates a pooled manager on the tokio clock with no event sink.
    #[must_use]
    pub fn new(config: ContextManagerConfig) -> Self {
        Self::with_parts(config, Arc::new(TokioClock), Arc::new(NoOpEventSink))
    }

    /// Creates a pooled manager with an explicit clock and event sink.
    #[must_use]
    pub fn with_parts(
        config: ContextManagerConfig,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let pool = Arc::new(MetadataPool::new(config.pool_capacity));
        let sweep_pool = Arc::clone(&pool);
        let core = ManagerCore::new(&config, clock, events, move |expired| {
            recycle(&sweep_pool, expired);
        });
        Self { core, pool }
    }

    /// Returns the number of idle maps in the pool.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }
}

fn recycle(pool: &MetadataPool, contexts: Vec<ExecutionContext>) {
    for ctx in contexts {
        if let Some(map) = ctx.into_metadata() {
            pool.release(map);
        }
    }
}

#[async_trait]
impl ContextLifecycle for PooledContextManager {
    fn create_context_with_id(
        &self,
        parent: &ExecutionContext,
        id: &str,
        metadata: Metadata,
    ) -> ExecutionContext {
        let mut map = self.pool.acquire();
        map.extend(metadata);

        let registry = &self.core.registry;
        let now = registry.clock.now();
        if id.is_empty() {
            return ExecutionContext::tracked(parent, None, map, now);
        }
        let ctx = ExecutionContext::tracked(parent, Some(id.to_string()), map, now);
        registry.insert(ctx.clone());
        ctx
    }

    fn get_context(&self, id: &str) -> Option<ExecutionContext> {
        self.core.registry.get(id)
    }

    fn update_context(&self, id: &str, delta: Metadata) -> ChainResult<()> {
        self.core.registry.update(id, delta)
    }

    fn remove_context(&self, id: &str) -> bool {
        match self.core.registry.remove(id) {
            Some(ctx) => {
                recycle(&self.pool, vec![ctx]);
                true
            }
            None => false,
        }
    }

    fn cleanup_expired_contexts(&self) -> usize {
        let expired = self.core.registry.sweep();
        let count = expired.len();
        recycle(&self.pool, expired);
        count
    }

    fn active_contexts(&self) -> usize {
        self.core.registry.len()
    }

    fn stats(&self) -> ContextStats {
        ContextStats {
            pool_size: Some(self.pool.len()),
            pool_capacity: Some(self.pool.capacity()),
            ..self.core.stats()
        }
    }

    async fn shutdown(&self) {
        let cleared = self.core.shutdown().await;
        recycle(&self.pool, cleared);
    }
}
