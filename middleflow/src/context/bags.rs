//! Thread-safe metadata bag carried by execution contexts.

use parking_lot::RwLock;
use std::collections::HashMap;

/// A thread-safe string-keyed bag of arbitrary JSON values.
///
/// Derived contexts share one bag, so a value written by an outer stage is
/// visible to every inner stage of the same traversal.
#[derive(Debug, Default)]
pub struct MetadataBag {
    data: RwLock<HashMap<String, serde_json::Value>>,
}

impl MetadataBag {
    /// Creates a new empty bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a bag from existing data.
    #[must_use]
    pub fn from_data(data: HashMap<String, serde_json::Value>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Gets a value from the bag.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.data.read().get(key).cloned()
    }

    /// Checks if a key exists.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.data.read().contains_key(key)
    }

    /// Sets a value, returning the previous one.
    pub fn set(&self, key: impl Into<String>, value: serde_json::Value) -> Option<serde_json::Value> {
        self.data.write().insert(key.into(), value)
    }

    /// Merges a delta into the bag; later keys overwrite earlier ones.
    pub fn merge(&self, delta: HashMap<String, serde_json::Value>) {
        self.data.write().extend(delta);
    }

    /// Removes a key.
    pub fn remove(&self, key: &str) -> Option<serde_json::Value> {
        self.data.write().remove(key)
    }

    /// Returns all keys.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.data.read().keys().cloned().collect()
    }

    /// Returns a copy of the data.
    #[must_use]
    pub fn to_map(&self) -> HashMap<String, serde_json::Value> {
        self.data.read().clone()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns true if the bag is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Consumes the bag and returns its map, keeping the allocation.
    #[must_use]
    pub(crate) fn into_inner(self) -> HashMap<String, serde_json::Value> {
        self.data.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_overwrites() {
        let bag = MetadataBag::new();
        assert!(bag.set("user", json!("alice")).is_none());
        assert_eq!(bag.set("user", json!("bob")), Some(json!("alice")));
        assert_eq!(bag.get("user"), Some(json!("bob")));
    }

    #[test]
    fn test_merge() {
        let bag = MetadataBag::from_data(HashMap::from([("a".to_string(), json!(1))]));
        bag.merge(HashMap::from([
            ("a".to_string(), json!(2)),
            ("b".to_string(), json!(3)),
        ]));

        assert_eq!(bag.len(), 2);
        assert_eq!(bag.get("a"), Some(json!(2)));
        assert!(bag.contains_key("b"));
    }

    #[test]
    fn test_into_inner_keeps_capacity() {
        let mut map = HashMap::with_capacity(64);
        map.insert("k".to_string(), json!(true));
        let bag = MetadataBag::from_data(map);

        let mut inner = bag.into_inner();
        inner.clear();
        assert!(inner.capacity() >= 64);
    }
}
