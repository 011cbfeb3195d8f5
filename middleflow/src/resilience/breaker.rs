//! Circuit breaker shared across retries and concurrent executions.

use crate::utils::{Clock, TokioClock};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Observable state of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls flow through; failures are being counted.
    Closed,
    /// Calls are refused.
    Open,
    /// Cool-down elapsed; calls are admitted and the next result decides.
    HalfOpen,
}

/// A gate that refuses calls once failures cross a threshold.
///
/// Implementations are shared by reference across concurrent executions and
/// must keep their counters consistent under concurrent updates.
#[cfg_attr(test, mockall::automock)]
pub trait CircuitBreaker: Send + Sync + Debug {
    /// Returns the breaker's name, used in errors and events.
    fn name(&self) -> &str;

    /// Returns true if calls must currently be refused.
    fn is_open(&self) -> bool;

    /// Records a successful call.
    fn record_success(&self);

    /// Records a failed call.
    fn record_failure(&self);

    /// Returns the current state.
    fn state(&self) -> BreakerState;
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    forced: bool,
}

/// Breaker that opens after N consecutive failures and half-opens after a cool-down.
///
/// - `Closed`: counts consecutive failures; a success resets the count.
/// - `Open`: refuses calls until `cool_down` has elapsed on the injected clock.
/// - `HalfOpen`: admits calls; a success closes, a failure re-opens.
///
/// [`ConsecutiveFailureBreaker::force_open`] pins the breaker open until
/// [`ConsecutiveFailureBreaker::reset`].
#[derive(Debug)]
pub struct ConsecutiveFailureBreaker {
    name: String,
    failure_threshold: u32,
    cool_down: Duration,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl ConsecutiveFailureBreaker {
    /// Creates a breaker on the tokio clock.
    #[must_use]
    pub fn new(name: impl Into<String>, failure_threshold: u32, cool_down: Duration) -> Self {
        Self::with_clock(name, failure_threshold, cool_down, Arc::new(TokioClock))
    }

    /// Creates a breaker on an explicit clock.
    #[must_use]
    pub fn with_clock(
        name: impl Into<String>,
        failure_threshold: u32,
        cool_down: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            cool_down,
            clock,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                forced: false,
            }),
        }
    }

    /// Opens the breaker and keeps it open until [`Self::reset`].
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        inner.forced = true;
        inner.state = BreakerState::Open;
        inner.opened_at = Some(self.clock.now());
        warn!(breaker = %self.name, "Circuit breaker forced open");
    }

    /// Closes the breaker and clears all failure accounting.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.forced = false;
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        debug!(breaker = %self.name, "Circuit breaker reset");
    }

    /// Returns the current consecutive failure count.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Returns the failure threshold.
    #[must_use]
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Returns the cool-down period.
    #[must_use]
    pub fn cool_down(&self) -> Duration {
        self.cool_down
    }

    fn open(&self, inner: &mut BreakerInner) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(self.clock.now());
        warn!(
            breaker = %self.name,
            failures = inner.consecutive_failures,
            "Circuit breaker opened"
        );
    }

    /// Moves an open breaker to half-open once the cool-down has elapsed.
    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.forced || inner.state != BreakerState::Open {
            return;
        }
        let cooled = inner
            .opened_at
            .map_or(true, |at| self.clock.now().saturating_duration_since(at) >= self.cool_down);
        if cooled {
            inner.state = BreakerState::HalfOpen;
            debug!(breaker = %self.name, "Circuit breaker half-open");
        }
    }
}

impl CircuitBreaker for ConsecutiveFailureBreaker {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state == BreakerState::Open
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.forced {
            return;
        }
        if inner.state != BreakerState::Closed {
            debug!(breaker = %self.name, "Circuit breaker closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        if inner.forced {
            return;
        }
        match inner.state {
            BreakerState::HalfOpen => self.open(&mut inner),
            BreakerState::Closed if inner.consecutive_failures >= self.failure_threshold => {
                self.open(&mut inner);
            }
            _ => {}
        }
    }

    fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }
}
