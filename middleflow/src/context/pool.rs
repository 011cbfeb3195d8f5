//! Reuse pool for context metadata maps.

use parking_lot::Mutex;
use std::collections::HashMap;

type Metadata = HashMap<String, serde_json::Value>;

/// Bounded free-list of cleared metadata maps.
#[derive(Debug)]
pub(crate) struct MetadataPool {
    idle: Mutex<Vec<Metadata>>,
    capacity: usize,
}

impl MetadataPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Takes an idle map, or allocates one if the pool is empty.
    pub(crate) fn acquire(&self) -> Metadata {
        self.idle.lock().pop().unwrap_or_default()
    }

    /// Clears `map` and keeps it for reuse. Returns false if the pool is full.
    pub(crate) fn release(&self, mut map: Metadata) -> bool {
        map.clear();
        let mut idle = self.idle.lock();
        if idle.len() >= self.capacity {
            return false;
        }
        idle.push(map);
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.idle.lock().len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_release_clears_and_reuses() {
        let pool = MetadataPool::new(2);
        let mut map = HashMap::with_capacity(16);
        map.insert("a".to_string(), json!(1));

        assert!(pool.release(map));
        assert_eq!(pool.len(), 1);

        let reused = pool.acquire();
        assert!(reused.is_empty());
        assert!(reused.capacity() >= 16);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_capacity_bound() {
        let pool = MetadataPool::new(1);
        assert!(pool.release(HashMap::new()));
        assert!(!pool.release(HashMap::new()));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.capacity(), 1);
    }
}
