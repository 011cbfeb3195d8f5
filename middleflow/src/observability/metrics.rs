//! Execution metrics for chains.

use crate::utils::Timestamp;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Read-only view of a chain's metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Completed executions.
    pub executions: u64,
    /// Executions that returned a response.
    pub successes: u64,
    /// Executions that returned an error.
    pub errors: u64,
    /// Executions during which at least one panic was recovered.
    pub panics: u64,
    /// Sum of execution durations.
    pub total_duration: Duration,
    /// Shortest execution, if any completed.
    pub min_duration: Option<Duration>,
    /// Longest execution.
    pub max_duration: Duration,
    /// Executions currently in flight.
    pub current_concurrency: u64,
    /// Highest observed in-flight count.
    pub peak_concurrency: u64,
    /// When the last execution completed.
    pub last_execution: Option<Timestamp>,
}

impl MetricsSnapshot {
    /// Returns the mean execution duration.
    #[must_use]
    pub fn average_duration(&self) -> Duration {
        if self.executions == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total_duration.as_nanos() / u128::from(self.executions);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Returns successes / executions, or 0.0 before the first execution.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.executions == 0 {
            return 0.0;
        }
        self.successes as f64 / self.executions as f64
    }

    /// Adds `other` into `self` field by field.
    ///
    /// Counters and durations are summed, the minimum and maximum are kept,
    /// and the latest completion timestamp wins.
    pub fn merge(&mut self, other: &Self) {
        self.executions += other.executions;
        self.successes += other.successes;
        self.errors += other.errors;
        self.panics += other.panics;
        self.total_duration += other.total_duration;
        self.min_duration = match (self.min_duration, other.min_duration) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max_duration = self.max_duration.max(other.max_duration);
        self.current_concurrency += other.current_concurrency;
        self.peak_concurrency += other.peak_concurrency;
        self.last_execution = self.last_execution.max(other.last_execution);
    }

    /// Folds many snapshots into one.
    #[must_use]
    pub fn merged<'a>(snapshots: impl IntoIterator<Item = &'a Self>) -> Self {
        snapshots.into_iter().fold(Self::default(), |mut acc, s| {
            acc.merge(s);
            acc
        })
    }
}

/// Outcome of one completed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Whether the execution returned a response.
    pub succeeded: bool,
    /// Whether a panic was recovered anywhere in the traversal.
    pub panicked: bool,
}

/// Thread-safe metrics accumulator, one per chain.
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    inner: RwLock<MetricsSnapshot>,
}

impl MetricsRecorder {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks an execution as in flight until the guard is dropped.
    #[must_use]
    pub fn enter(&self) -> ConcurrencyGuard<'_> {
        let mut inner = self.inner.write();
        inner.current_concurrency += 1;
        inner.peak_concurrency = inner.peak_concurrency.max(inner.current_concurrency);
        ConcurrencyGuard { recorder: self }
    }

    /// Records a completed execution.
    pub fn record(&self, duration: Duration, outcome: ExecutionOutcome) {
        let mut inner = self.inner.write();
        inner.executions += 1;
        if outcome.succeeded {
            inner.successes += 1;
        } else {
            inner.errors += 1;
        }
        if outcome.panicked {
            inner.panics += 1;
        }
        inner.total_duration += duration;
        inner.min_duration = Some(inner.min_duration.map_or(duration, |min| min.min(duration)));
        inner.max_duration = inner.max_duration.max(duration);
        inner.last_execution = Some(chrono::Utc::now());
    }

    /// Returns a copy of the current metrics.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.read().clone()
    }

    /// Clears all counters. In-flight executions stay counted as in flight.
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        let current = inner.current_concurrency;
        *inner = MetricsSnapshot {
            current_concurrency: current,
            peak_concurrency: current,
            ..MetricsSnapshot::default()
        };
    }
}

/// Decrements the in-flight count on drop.
#[derive(Debug)]
pub struct ConcurrencyGuard<'a> {
    recorder: &'a MetricsRecorder,
}

impl Drop for ConcurrencyGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.recorder.inner.write();
        inner.current_concurrency = inner.current_concurrency.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const OK: ExecutionOutcome = ExecutionOutcome {
        succeeded: true,
        panicked: false,
    };
    const PANIC: ExecutionOutcome = ExecutionOutcome {
        succeeded: false,
        panicked: true,
    };

    #[test]
    fn test_record_tracks_min_avg_max() {
        let recorder = MetricsRecorder::new();
        recorder.record(Duration::from_millis(10), OK);
        recorder.record(Duration::from_millis(30), OK);
        recorder.record(Duration::from_millis(20), PANIC);

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.executions, 3);
        assert_eq!(snapshot.successes, 2);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.panics, 1);
        assert_eq!(snapshot.min_duration, Some(Duration::from_millis(10)));
        assert_eq!(snapshot.max_duration, Duration::from_millis(30));
        assert_eq!(snapshot.average_duration(), Duration::from_millis(20));
        assert!(snapshot.last_execution.is_some());
    }

    #[test]
    fn test_success_rate() {
        let recorder = MetricsRecorder::new();
        assert_eq!(recorder.snapshot().success_rate(), 0.0);

        recorder.record(Duration::ZERO, OK);
        recorder.record(Duration::ZERO, PANIC);
        assert!((recorder.snapshot().success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_concurrency_guard() {
        let recorder = MetricsRecorder::new();
        {
            let _a = recorder.enter();
            let _b = recorder.enter();
            assert_eq!(recorder.snapshot().current_concurrency, 2);
        }

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.current_concurrency, 0);
        assert_eq!(snapshot.peak_concurrency, 2);
    }

    #[test]
    fn test_reset_keeps_in_flight() {
        let recorder = MetricsRecorder::new();
        let guard = recorder.enter();
        recorder.record(Duration::from_millis(5), OK);

        recorder.reset();
        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.executions, 0);
        assert_eq!(snapshot.current_concurrency, 1);

        drop(guard);
        assert_eq!(recorder.snapshot().current_concurrency, 0);
    }

    #[test]
    fn test_merge_is_field_wise() {
        let a = MetricsRecorder::new();
        a.record(Duration::from_millis(10), OK);
        let b = MetricsRecorder::new();
        b.record(Duration::from_millis(40), PANIC);
        b.record(Duration::from_millis(4), OK);

        let merged = MetricsSnapshot::merged([&a.snapshot(), &b.snapshot()]);

        assert_eq!(merged.executions, 3);
        assert_eq!(merged.successes, 2);
        assert_eq!(merged.panics, 1);
        assert_eq!(merged.total_duration, Duration::from_millis(54));
        assert_eq!(merged.min_duration, Some(Duration::from_millis(4)));
        assert_eq!(merged.max_duration, Duration::from_millis(40));
    }

    #[test]
    fn test_snapshot_serializes() {
        let recorder = MetricsRecorder::new();
        recorder.record(Duration::from_millis(1), OK);

        let json = serde_json::to_value(recorder.snapshot()).unwrap();
        assert_eq!(json["executions"], 1);
    }
}
