//! Event sink system for observability.
//!
//! Sinks receive structured engine events (`chain.completed`,
//! `stage.retry_scheduled`, ...). Emission is best-effort: a sink can never
//! change the outcome of an execution.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
