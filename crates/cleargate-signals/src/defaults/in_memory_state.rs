//! In-memory versioned state store for door and trigger state.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::errors::StateError;
use crate::traits::{StateStore, Versioned};

/// Per-scope state: maps key → (value, version).
type ScopeState = HashMap<String, (Value, u64)>;

/// In-memory state store backed by a `HashMap` protected by `RwLock`.
///
/// Versions start at 1 and increase by one per successful save. The write
/// lock is held across the version check and the write, which makes
/// [`save()`](StateStore::save) an atomic compare-and-swap.
pub struct InMemoryStateStore {
    state: RwLock<HashMap<String, ScopeState>>,
}

impl InMemoryStateStore {
    /// Create a new empty in-memory state store.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(HashMap::new()),
        }
    }

    /// Number of keys stored under `scope`.
    pub async fn len(&self, scope: &str) -> usize {
        self.state.read().await.get(scope).map_or(0, HashMap::len)
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, scope: &str, key: &str) -> Result<Option<Versioned>, StateError> {
        let guard = self.state.read().await;
        Ok(guard
            .get(scope)
            .and_then(|s| s.get(key))
            .map(|(value, version)| Versioned {
                value: value.clone(),
                version: *version,
            }))
    }

    async fn save(
        &self,
        scope: &str,
        key: &str,
        value: Value,
        expected_version: Option<u64>,
    ) -> Result<u64, StateError> {
        let mut guard = self.state.write().await;
        let entries = guard.entry(scope.to_string()).or_default();
        let current = entries.get(key).map(|(_, v)| *v);
        if current != expected_version {
            return Err(StateError::Conflict {
                scope: scope.to_string(),
                key: key.to_string(),
                expected: expected_version,
                actual: current,
            });
        }
        let next = current.map_or(1, |v| v + 1);
        entries.insert(key.to_string(), (value, next));
        Ok(next)
    }

    async fn remove(&self, scope: &str, key: &str) -> Result<(), StateError> {
        let mut guard = self.state.write().await;
        if let Some(entries) = guard.get_mut(scope) {
            entries.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_save_and_load() {
        let store = InMemoryStateStore::new();
        let v1 = store
            .save("doors", "d1", json!({"n": 1}), None)
            .await
            .expect("first save");
        assert_eq!(v1, 1);

        let loaded = store.load("doors", "d1").await.expect("loads");
        assert_eq!(
            loaded,
            Some(Versioned {
                value: json!({"n": 1}),
                version: 1
            })
        );
    }

    #[tokio::test]
    async fn test_load_missing() {
        let store = InMemoryStateStore::new();
        assert_eq!(store.load("doors", "missing").await.expect("loads"), None);
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let store = InMemoryStateStore::new();
        store.save("t", "k", json!(1), None).await.expect("create");
        store.save("t", "k", json!(2), Some(1)).await.expect("update");

        let err = store.save("t", "k", json!(3), Some(1)).await.unwrap_err();
        assert!(matches!(
            err,
            StateError::Conflict {
                expected: Some(1),
                actual: Some(2),
                ..
            }
        ));
        // Creating over an existing key is also a conflict.
        assert!(store.save("t", "k", json!(3), None).await.is_err());
        assert_eq!(
            store.load("t", "k").await.expect("loads").map(|v| v.value),
            Some(json!(2))
        );
    }

    #[tokio::test]
    async fn test_scopes_are_isolated() {
        let store = InMemoryStateStore::new();
        store.save("doors", "x", json!("d"), None).await.expect("save");
        store.save("triggers", "x", json!("t"), None).await.expect("save");
        assert_eq!(store.len("doors").await, 1);

        store.remove("doors", "x").await.expect("remove");
        assert_eq!(store.load("doors", "x").await.expect("loads"), None);
        assert!(store.load("triggers", "x").await.expect("loads").is_some());
    }
}
