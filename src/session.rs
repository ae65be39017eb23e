//! Opaque per-connection session storage
//!
//! A string-keyed map of `Any` values the engine itself never interprets.
//! Handlers typically stash authentication results or room membership here
//! during `on_open` and read it back in later callbacks.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

type Value = Arc<dyn Any + Send + Sync>;

/// Concurrent session storage
#[derive(Default)]
pub struct Session {
    map: RwLock<HashMap<String, Value>>,
}

impl Session {
    /// Create empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value under `key`, replacing any previous one
    pub fn store(&self, key: impl Into<String>, value: Value) {
        self.map.write().insert(key.into(), value);
    }

    /// Load the value stored under `key`
    pub fn load(&self, key: &str) -> Option<Value> {
        self.map.read().get(key).cloned()
    }

    /// Load and downcast in one step
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.load(key).and_then(|v| v.downcast::<T>().ok())
    }

    /// Remove and return the value stored under `key`
    pub fn delete(&self, key: &str) -> Option<Value> {
        self.map.write().remove(key)
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Whether the storage is empty
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_load_delete() {
        let session = Session::new();
        assert!(session.is_empty());

        session.store("user", Arc::new(String::from("alice")));
        assert_eq!(session.len(), 1);

        let user = session.get::<String>("user").unwrap();
        assert_eq!(user.as_str(), "alice");

        assert!(session.delete("user").is_some());
        assert!(session.load("user").is_none());
    }

    #[test]
    fn test_downcast_mismatch() {
        let session = Session::new();
        session.store("count", Arc::new(7u64));
        assert!(session.get::<String>("count").is_none());
        assert_eq!(*session.get::<u64>("count").unwrap(), 7);
    }

    #[test]
    fn test_store_replaces() {
        let session = Session::new();
        session.store("k", Arc::new(1u32));
        session.store("k", Arc::new(2u32));
        assert_eq!(*session.get::<u32>("k").unwrap(), 2);
        assert_eq!(session.len(), 1);
    }
}
