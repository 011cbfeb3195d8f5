//! Retry policy with configurable backoff and jitter strategies.
//!
//! A [`RetryPolicy`] bounds the number of attempts for one stage call,
//! computes the delay before each retry, and classifies which errors may be
//! retried at all.

use crate::errors::{ChainError, ErrorKind};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Maps a retry number (1 for the first retry) to the delay before it.
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^(retry - 1)
    #[default]
    Exponential,
    /// delay = base * retry
    Linear,
    /// delay = base
    Constant,
}

/// Jitter strategy to prevent thundering herd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    #[default]
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    Equal,
}

/// Serializable description of a backoff curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Base delay in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub strategy: BackoffStrategy,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            strategy: BackoffStrategy::Exponential,
            jitter: JitterStrategy::None,
        }
    }
}

impl BackoffConfig {
    /// Creates a constant backoff.
    #[must_use]
    pub fn constant(delay: Duration) -> Self {
        Self {
            base_delay_ms: duration_ms(delay),
            strategy: BackoffStrategy::Constant,
            ..Self::default()
        }
    }

    /// Creates a linear backoff.
    #[must_use]
    pub fn linear(base: Duration) -> Self {
        Self {
            base_delay_ms: duration_ms(base),
            strategy: BackoffStrategy::Linear,
            ..Self::default()
        }
    }

    /// Creates an exponential backoff.
    #[must_use]
    pub fn exponential(base: Duration) -> Self {
        Self {
            base_delay_ms: duration_ms(base),
            strategy: BackoffStrategy::Exponential,
            ..Self::default()
        }
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, max: Duration) -> Self {
        self.max_delay_ms = duration_ms(max);
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculates the delay before retry number `retry` (1-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay_ms;
        let max = self.max_delay_ms;
        let step = retry.max(1);

        let delay = match self.strategy {
            BackoffStrategy::Exponential => {
                base.saturating_mul(2u64.saturating_pow(step - 1)).min(max)
            }
            BackoffStrategy::Linear => base.saturating_mul(u64::from(step)).min(max),
            BackoffStrategy::Constant => base.min(max),
        };

        let jittered = match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };

        Duration::from_millis(jittered)
    }

    /// Converts the config into a backoff function.
    #[must_use]
    pub fn into_backoff_fn(self) -> BackoffFn {
        Arc::new(move |retry| self.delay_for(retry))
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Which errors a policy may retry.
#[derive(Clone, Default)]
pub enum Retryable {
    /// Retry every error except cancellation.
    #[default]
    All,
    /// Retry only errors whose kind (or root cause kind) is listed.
    Kinds(Vec<ErrorKind>),
    /// Retry errors accepted by the predicate.
    Predicate(Arc<dyn Fn(&ChainError) -> bool + Send + Sync>),
}

impl Retryable {
    /// Returns true if `error` matches this classification.
    #[must_use]
    pub fn matches(&self, error: &ChainError) -> bool {
        match self {
            Self::All => true,
            Self::Kinds(kinds) => {
                kinds.contains(&error.kind()) || kinds.contains(&error.root_cause().kind())
            }
            Self::Predicate(predicate) => predicate(error),
        }
    }
}

impl fmt::Debug for Retryable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "All"),
            Self::Kinds(kinds) => f.debug_tuple("Kinds").field(kinds).finish(),
            Self::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

/// Retry policy applied to every stage call of a chain.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt.
    pub max_retries: u32,
    backoff: BackoffFn,
    retryable: Retryable,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// Creates a policy with `max_retries` retries and the default backoff.
    #[must_use]
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: BackoffConfig::default().into_backoff_fn(),
            retryable: Retryable::All,
        }
    }

    /// Creates a policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self::new(0)
    }

    /// Sets the backoff function.
    #[must_use]
    pub fn with_backoff(mut self, backoff: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Sets the backoff from a config.
    #[must_use]
    pub fn with_backoff_config(mut self, config: BackoffConfig) -> Self {
        self.backoff = config.into_backoff_fn();
        self
    }

    /// Sets the retryable classification.
    #[must_use]
    pub fn with_retryable(mut self, retryable: Retryable) -> Self {
        self.retryable = retryable;
        self
    }

    /// Restricts retries to the given error kinds.
    #[must_use]
    pub fn retry_on(self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.with_retryable(Retryable::Kinds(kinds.into_iter().collect()))
    }

    /// Returns the total number of attempts allowed.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Computes the delay before retry number `retry`. Never cached.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        (self.backoff)(retry)
    }

    /// Returns true if `error` may be retried under this policy.
    #[must_use]
    pub fn is_retryable(&self, error: &ChainError) -> bool {
        error.is_retryable_by_default() && self.retryable.matches(error)
    }

    /// Returns the retryable classification.
    #[must_use]
    pub fn retryable(&self) -> &Retryable {
        &self.retryable
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("retryable", &self.retryable)
            .finish_non_exhaustive()
    }
}
