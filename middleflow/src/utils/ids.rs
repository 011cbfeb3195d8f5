//! Identifier and timestamp helpers.

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

/// Represents a wall-clock timestamp.
pub type Timestamp = DateTime<Utc>;

/// Generates a new tracked-context identifier.
///
/// Identifiers are time-ordered (UUID v7) so registry dumps sort by creation.
#[must_use]
pub fn generate_context_id() -> String {
    format!("ctx_{}", Uuid::now_v7().simple())
}

/// Returns the current UTC time as an RFC 3339 string with microseconds.
#[must_use]
pub fn iso_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
