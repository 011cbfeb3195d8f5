//! Observability utilities.
//!
//! Chains keep one [`MetricsRecorder`] each. Snapshots are cheap copies that
//! can be polled while executions are in flight.

mod metrics;

pub use metrics::{ConcurrencyGuard, ExecutionOutcome, MetricsRecorder, MetricsSnapshot};
