//! Utility types for time and identifier handling.
//!
//! The engine never reads the process clock directly for backoff waits or
//! context ages; it goes through an injected [`Clock`] so tests can swap in a
//! deterministic [`ManualClock`].

mod clock;
mod ids;

pub use clock::{Clock, ManualClock, TokioClock};
pub use ids::{generate_context_id, iso_timestamp, Timestamp};
