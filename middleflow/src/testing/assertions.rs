//! Test assertions for chain results.

use super::CallLog;
use crate::errors::{ChainError, ChainResult, ErrorKind};

/// Asserts that the result is a success and returns the response.
pub fn assert_succeeded<T: std::fmt::Debug>(result: ChainResult<T>) -> T {
    match result {
        Ok(response) => response,
        Err(err) => panic!("Expected success, got error: {err}"),
    }
}

/// Asserts that the result is an error of the given kind and returns it.
///
/// Unless `expected` is [`ErrorKind::RetriesExhausted`], the kind is read
/// from the root cause, so a stage failure matches with or without its
/// attempt-count wrapper.
pub fn assert_error_kind<T: std::fmt::Debug>(result: ChainResult<T>, expected: ErrorKind) -> ChainError {
    match result {
        Ok(response) => panic!("Expected {expected:?} error, got response: {response:?}"),
        Err(err) => {
            let actual = if expected == ErrorKind::RetriesExhausted {
                err.kind()
            } else {
                err.root_cause().kind()
            };
            assert_eq!(
                actual, expected,
                "Expected {:?} error, got {:?}: {}",
                expected, actual, err
            );
            err
        }
    }
}

/// Asserts that the result is a cancellation error.
pub fn assert_cancelled<T: std::fmt::Debug>(result: ChainResult<T>) -> ChainError {
    assert_error_kind(result, ErrorKind::Cancelled)
}

/// Asserts that the result is a recovered panic raised in `stage`.
pub fn assert_stage_fault<T: std::fmt::Debug>(result: ChainResult<T>, stage: &str) -> ChainError {
    let err = assert_error_kind(result, ErrorKind::StageFault);
    assert_eq!(
        err.stage_name(),
        Some(stage),
        "Expected fault in '{}', got: {}",
        stage,
        err
    );
    err
}

/// Asserts that the log holds exactly `expected`, in order.
pub fn assert_call_order(log: &CallLog, expected: &[&str]) {
    let entries = log.entries();
    assert_eq!(
        entries, expected,
        "Expected call order {:?}, got {:?}",
        expected, entries
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assert_succeeded_returns_response() {
        assert_eq!(assert_succeeded::<u8>(Ok(4)), 4);
    }

    #[test]
    fn test_assert_stage_fault() {
        let result: ChainResult<()> = Err(ChainError::StageFault {
            stage: "auth".to_string(),
            message: "boom".to_string(),
        });
        let err = assert_stage_fault(result, "auth");
        assert!(err.is_fault());
    }

    #[test]
    fn test_assert_error_kind_sees_through_attempt_count() {
        let result: ChainResult<()> = Err(ChainError::RetriesExhausted {
            stage: "auth".to_string(),
            attempts: 1,
            source: Box::new(ChainError::stage("auth", "denied")),
        });
        let err = assert_error_kind(result.clone(), ErrorKind::Stage);
        assert_eq!(err.attempts(), Some(1));
        assert_error_kind(result, ErrorKind::RetriesExhausted);
    }

    #[test]
    #[should_panic(expected = "Expected Cancelled error")]
    fn test_assert_cancelled_rejects_success() {
        assert_cancelled::<u8>(Ok(1));
    }
}
