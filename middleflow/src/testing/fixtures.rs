//! Shared fixtures for chain tests.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::events::CollectingEventSink;

/// An ordered, shareable log of middleware calls.
///
/// Clones share the same underlying log.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    /// Returns a copy of every entry in call order.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Checks if nothing was logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Returns a collecting sink along with a handle suitable for
/// `ExecutionConfig::with_events`.
#[must_use]
pub fn collecting_events() -> (Arc<CollectingEventSink>, Arc<dyn crate::events::EventSink>) {
    let sink = Arc::new(CollectingEventSink::new());
    let handle: Arc<dyn crate::events::EventSink> = sink.clone();
    (sink, handle)
}
