//! Error types for the middleflow engine.
//!
//! Every failure an `execute` call can produce is a [`ChainError`]. The
//! variants form the engine's error taxonomy: cancellation, stage faults
//! (recovered panics), exhausted retries, an open circuit, unknown context
//! identifiers, and the stage's own errors.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Why a context's signal fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CancelCause {
    /// The context (or one of its ancestors) was cancelled explicitly.
    Cancelled,
    /// The context's deadline passed.
    DeadlineExceeded,
}

impl std::fmt::Display for CancelCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "context canceled"),
            Self::DeadlineExceeded => write!(f, "context deadline exceeded"),
        }
    }
}

/// Coarse classification of a [`ChainError`], used by retry allow-lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`ChainError::Cancelled`].
    Cancelled,
    /// See [`ChainError::StageFault`].
    StageFault,
    /// See [`ChainError::RetriesExhausted`].
    RetriesExhausted,
    /// See [`ChainError::CircuitOpen`].
    CircuitOpen,
    /// See [`ChainError::NotFound`].
    NotFound,
    /// See [`ChainError::Stage`].
    Stage,
    /// See [`ChainError::Registry`].
    Registry,
    /// See [`ChainError::Configuration`].
    Configuration,
}

/// The main error type for middleflow operations.
#[derive(Debug, Clone, Error)]
pub enum ChainError {
    /// The context's signal fired before or during a stage call.
    #[error("context cancelled: {0}")]
    Cancelled(CancelCause),

    /// A panic was intercepted while a stage was running.
    #[error("panic in middleware '{stage}': {message}")]
    StageFault {
        /// The stage that panicked.
        stage: String,
        /// Description of the panic payload.
        message: String,
    },

    /// Every permitted attempt for one stage failed.
    #[error("middleware '{stage}' failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// The stage that was retried.
        stage: String,
        /// Number of attempts made.
        attempts: u32,
        /// The last underlying error.
        #[source]
        source: Box<ChainError>,
    },

    /// The circuit breaker refused the attempt; no attempt was made.
    #[error("circuit breaker '{breaker}' is open")]
    CircuitOpen {
        /// The breaker's name.
        breaker: String,
    },

    /// A context-manager lookup referenced an unknown identifier.
    #[error("context with ID {id} not found")]
    NotFound {
        /// The identifier that was looked up.
        id: String,
    },

    /// A stage (or the terminal handler) reported its own failure.
    #[error("middleware '{stage}' failed: {message}")]
    Stage {
        /// The failing stage.
        stage: String,
        /// The failure message.
        message: String,
    },

    /// A middleware registry lookup or construction failed.
    #[error("registry error: {0}")]
    Registry(String),

    /// The configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ChainError {
    /// Creates a stage failure.
    #[must_use]
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Converts an arbitrary error raised inside a stage.
    #[must_use]
    pub fn from_stage(stage: impl Into<String>, error: &anyhow::Error) -> Self {
        Self::Stage {
            stage: stage.into(),
            message: format!("{error:#}"),
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Returns the error's kind.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::StageFault { .. } => ErrorKind::StageFault,
            Self::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Stage { .. } => ErrorKind::Stage,
            Self::Registry(_) => ErrorKind::Registry,
            Self::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Returns true for cancellation errors.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Returns false for errors that must never be retried, whatever the policy.
    #[must_use]
    pub fn is_retryable_by_default(&self) -> bool {
        !self.is_cancelled()
    }

    /// Returns true if a panic was converted into this error.
    #[must_use]
    pub fn is_fault(&self) -> bool {
        matches!(self.root_cause(), Self::StageFault { .. })
    }

    /// Strips `RetriesExhausted` layers and returns the innermost error.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        let mut current = self;
        while let Self::RetriesExhausted { source, .. } = current {
            current = source;
        }
        current
    }

    /// Returns the attempt count if this is an exhausted-retries error.
    #[must_use]
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::RetriesExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// Returns the stage this error is attributed to, if any.
    #[must_use]
    pub fn stage_name(&self) -> Option<&str> {
        match self {
            Self::StageFault { stage, .. }
            | Self::Stage { stage, .. }
            | Self::RetriesExhausted { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// Converts to a dictionary representation for event payloads.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("kind".to_string(), serde_json::json!(self.kind()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));

        match self {
            Self::StageFault { stage, .. } | Self::Stage { stage, .. } => {
                map.insert("stage".to_string(), serde_json::json!(stage));
            }
            Self::RetriesExhausted { stage, attempts, .. } => {
                map.insert("stage".to_string(), serde_json::json!(stage));
                map.insert("attempts".to_string(), serde_json::json!(attempts));
            }
            Self::CircuitOpen { breaker } => {
                map.insert("breaker".to_string(), serde_json::json!(breaker));
            }
            Self::NotFound { id } => {
                map.insert("id".to_string(), serde_json::json!(id));
            }
            Self::Cancelled(_) | Self::Registry(_) | Self::Configuration(_) => {}
        }

        map
    }
}

impl From<CancelCause> for ChainError {
    fn from(cause: CancelCause) -> Self {
        Self::Cancelled(cause)
    }
}

/// Result alias used throughout the crate.
pub type ChainResult<T> = Result<T, ChainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            ChainError::Cancelled(CancelCause::Cancelled).kind(),
            ErrorKind::Cancelled
        );
        assert_eq!(ChainError::stage("auth", "denied").kind(), ErrorKind::Stage);
        assert_eq!(ChainError::not_found("ctx_1").kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_root_cause_unwraps_nested_retries() {
        let inner = ChainError::stage("db", "timeout");
        let err = ChainError::RetriesExhausted {
            stage: "outer".to_string(),
            attempts: 2,
            source: Box::new(ChainError::RetriesExhausted {
                stage: "db".to_string(),
                attempts: 3,
                source: Box::new(inner),
            }),
        };

        assert_eq!(err.attempts(), Some(2));
        assert_eq!(err.root_cause().kind(), ErrorKind::Stage);
        assert!(err.to_string().contains("after 2 attempts"));
    }

    #[test]
    fn test_from_anyhow_keeps_context() {
        let source = anyhow::anyhow!("connection refused").context("dialing upstream");
        let err = ChainError::from_stage("proxy", &source);

        assert!(err.to_string().contains("dialing upstream"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_cancel_cause_display() {
        let err: ChainError = CancelCause::DeadlineExceeded.into();
        assert_eq!(err.to_string(), "context cancelled: context deadline exceeded");
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_to_dict() {
        let err = ChainError::CircuitOpen {
            breaker: "upstream".to_string(),
        };
        let dict = err.to_dict();

        assert_eq!(dict.get("kind").unwrap(), "circuit_open");
        assert_eq!(dict.get("breaker").unwrap(), "upstream");
    }

    #[test]
    fn test_stage_name() {
        assert_eq!(ChainError::stage("auth", "denied").stage_name(), Some("auth"));
        assert_eq!(ChainError::not_found("ctx_1").stage_name(), None);
        assert!(!ChainError::from(CancelCause::Cancelled).is_retryable_by_default());
    }
}
