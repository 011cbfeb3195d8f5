//! Request/response payload bound.

/// A value that flows through a chain as request and response.
///
/// `is_absent` defines "no response" for parallel aggregation.
pub trait Payload: Clone + Send + Sync + 'static {
    /// Returns true if the value carries nothing.
    fn is_absent(&self) -> bool {
        false
    }
}

impl Payload for serde_json::Value {
    fn is_absent(&self) -> bool {
        self.is_null()
    }
}

impl<U: Clone + Send + Sync + 'static> Payload for Option<U> {
    fn is_absent(&self) -> bool {
        self.is_none()
    }
}

impl Payload for String {}

impl Payload for Vec<u8> {}

impl Payload for () {}
