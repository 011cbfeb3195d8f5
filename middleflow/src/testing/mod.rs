//! Testing utilities for middleware chains.
//!
//! This module provides:
//! - Mock middleware (recording, failing, flaky, panicking, slow)
//! - A shared call log and event fixtures
//! - Assertions over chain results

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_call_order, assert_cancelled, assert_error_kind, assert_stage_fault, assert_succeeded,
};
pub use fixtures::{collecting_events, CallLog};
pub use mocks::{
    FailingMiddleware, FlakyMiddleware, PanickingMiddleware, RecordingMiddleware, SlowMiddleware,
};
