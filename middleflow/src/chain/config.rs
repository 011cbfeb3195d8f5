//! Chain configuration: the runtime [`ExecutionConfig`] and its serializable
//! counterpart [`ChainSettings`].

use crate::errors::{ChainError, ChainResult, ErrorKind};
use crate::events::{EventSink, NoOpEventSink};
use crate::resilience::{BackoffConfig, CircuitBreaker, ConsecutiveFailureBreaker, RetryPolicy};
use crate::utils::{Clock, TokioClock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Runtime configuration of a chain.
///
/// Swapped as a whole by `update_config`; executions already in flight keep
/// the configuration they started with.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Chain name, used in logs and events.
    pub name: String,
    /// Timeout applied to the whole traversal.
    pub timeout: Option<Duration>,
    /// Retry policy applied to every stage call.
    pub retry: RetryPolicy,
    /// Breaker shared by every stage call.
    pub breaker: Option<Arc<dyn CircuitBreaker>>,
    /// Clock used for backoff waits.
    pub clock: Arc<dyn Clock>,
    /// Sink for engine events.
    pub events: Arc<dyn EventSink>,
    /// Free-form properties.
    pub properties: HashMap<String, serde_json::Value>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self::new("chain")
    }
}

impl ExecutionConfig {
    /// Creates a config with no timeout, no retries, and no breaker.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: None,
            retry: RetryPolicy::none(),
            breaker: None,
            clock: Arc::new(TokioClock),
            events: Arc::new(NoOpEventSink),
            properties: HashMap::new(),
        }
    }

    /// Sets the traversal timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the circuit breaker.
    #[must_use]
    pub fn with_breaker(mut self, breaker: Arc<dyn CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Sets the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets a property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

/// Serializable breaker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Milliseconds the breaker stays open before half-opening.
    pub cool_down_ms: u64,
}

/// One middleware entry in [`ChainSettings`], resolved through a registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiddlewareSpec {
    /// Registered constructor name.
    pub name: String,
    /// Properties handed to the constructor.
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
}

impl MiddlewareSpec {
    /// Creates a middleware entry with no properties.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: HashMap::new(),
        }
    }

    /// Sets a property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

/// Serializable chain description, loadable from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainSettings {
    /// Chain name.
    pub name: String,
    /// Traversal timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Backoff curve.
    pub backoff: BackoffConfig,
    /// Retryable error kinds; `None` retries everything.
    pub retry_on: Option<Vec<ErrorKind>>,
    /// Breaker settings.
    pub breaker: Option<BreakerSettings>,
    /// Middleware to build, outermost first.
    pub middleware: Vec<MiddlewareSpec>,
    /// Free-form properties.
    pub properties: HashMap<String, serde_json::Value>,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            name: "chain".to_string(),
            timeout_ms: None,
            max_retries: 0,
            backoff: BackoffConfig::default(),
            retry_on: None,
            breaker: None,
            middleware: Vec::new(),
            properties: HashMap::new(),
        }
    }
}

impl ChainSettings {
    /// Parses and validates settings from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Configuration`] if the JSON is malformed or the
    /// settings are inconsistent.
    pub fn from_json_str(json: &str) -> ChainResult<Self> {
        let settings: Self = serde_json::from_str(json)
            .map_err(|e| ChainError::Configuration(format!("invalid chain settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks the settings for inconsistencies.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Configuration`] describing the first problem found.
    pub fn validate(&self) -> ChainResult<()> {
        if self.name.trim().is_empty() {
            return Err(ChainError::Configuration("chain name is empty".to_string()));
        }
        if self.timeout_ms == Some(0) {
            return Err(ChainError::Configuration("timeout_ms must be positive".to_string()));
        }
        if self.backoff.max_delay_ms < self.backoff.base_delay_ms {
            return Err(ChainError::Configuration(
                "backoff max_delay_ms is below base_delay_ms".to_string(),
            ));
        }
        if let Some(breaker) = &self.breaker {
            if breaker.failure_threshold == 0 {
                return Err(ChainError::Configuration(
                    "breaker failure_threshold must be positive".to_string(),
                ));
            }
        }
        if let Some(spec) = self.middleware.iter().find(|m| m.name.trim().is_empty()) {
            return Err(ChainError::Configuration(format!(
                "middleware entry with empty name (properties: {})",
                spec.properties.len()
            )));
        }
        Ok(())
    }

    /// Returns the retry policy these settings describe.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::new(self.max_retries).with_backoff_config(self.backoff);
        match &self.retry_on {
            Some(kinds) => policy.retry_on(kinds.iter().copied()),
            None => policy,
        }
    }

    /// Builds a runtime config. The breaker, if any, runs on `clock`.
    #[must_use]
    pub fn into_config(self, clock: Arc<dyn Clock>) -> ExecutionConfig {
        let retry = self.retry_policy();
        let mut config = ExecutionConfig::new(self.name.clone())
            .with_retry(retry)
            .with_clock(Arc::clone(&clock));
        config.properties = self.properties;

        if let Some(timeout_ms) = self.timeout_ms {
            config = config.with_timeout(Duration::from_millis(timeout_ms));
        }
        if let Some(breaker) = self.breaker {
            config = config.with_breaker(Arc::new(ConsecutiveFailureBreaker::with_clock(
                self.name,
                breaker.failure_threshold,
                Duration::from_millis(breaker.cool_down_ms),
                clock,
            )));
        }
        config
    }
}
