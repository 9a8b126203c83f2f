//! Namespaced storage over a Redis-style backing store.
//!
//! [`KvBackend`] is the thin seam over the store itself: string keys, string
//! values, pattern scans, and sets for the tenant index. [`RedisBackend`] is
//! the production implementation; [`MemoryBackend`] backs tests and local
//! development without a Redis instance.
//!
//! [`NamespacedStorage`] implements the fabric's storage contract on top,
//! prefixing every key with its tenant prefix so tenants cannot read each
//! other's data. Layout: `{prefix}:{collection}:{key}`, values JSON.

mod memory;
mod redis_backend;

pub use memory::MemoryBackend;
pub use redis_backend::RedisBackend;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use weft_core::schema::SchemaRegistry;
use weft_core::storage::{StorageAdapter, StorageError, StorageEvent, EVENT_CHANNEL_CAPACITY};

/// The backing-store operations the fabric needs.
///
/// Implementations must be safe for concurrent use; one backend instance is
/// shared by every tenant adapter a bucket manager produces.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Read a string value.
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write a string value.
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Delete a key. Returns whether it existed.
    async fn del(&self, key: &str) -> Result<bool, StorageError>;

    /// Whether a key exists.
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// All keys matching a glob pattern, as a best-effort snapshot.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StorageError>;

    /// Add a member to a set.
    async fn set_add(&self, key: &str, member: &str) -> Result<(), StorageError>;

    /// Remove a member from a set.
    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StorageError>;

    /// All members of a set.
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StorageError>;
}

/// A tenant-scoped storage adapter over a shared [`KvBackend`].
pub struct NamespacedStorage {
    prefix: String,
    backend: Arc<dyn KvBackend>,
    schemas: Arc<SchemaRegistry>,
    events: broadcast::Sender<StorageEvent>,
}

impl NamespacedStorage {
    /// Create an adapter scoping every key under `prefix`.
    pub fn new(
        prefix: impl Into<String>,
        backend: Arc<dyn KvBackend>,
        schemas: Arc<SchemaRegistry>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            prefix: prefix.into(),
            backend,
            schemas,
            events,
        }
    }

    /// The tenant prefix this adapter scopes to.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn entry_key(&self, collection: &str, key: &str) -> String {
        format!("{}:{}:{}", self.prefix, collection, key)
    }

    fn scan_pattern(&self, collection: Option<&str>) -> String {
        match collection {
            Some(c) => format!("{}:{}:*", self.prefix, c),
            None => format!("{}:*", self.prefix),
        }
    }

    fn emit(&self, event: StorageEvent) {
        let _ = self.events.send(event);
    }

    fn fail(&self, err: StorageError) -> StorageError {
        self.emit(StorageEvent::Error {
            message: err.to_string(),
        });
        err
    }
}

#[async_trait]
impl StorageAdapter for NamespacedStorage {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StorageError> {
        let raw = self
            .backend
            .get(&self.entry_key(collection, key))
            .await
            .map_err(|e| self.fail(e))?;
        let value = match raw {
            None => None,
            Some(raw) => {
                let value: Value =
                    serde_json::from_str(&raw).map_err(|e| self.fail(StorageError::Json(e)))?;
                // A stored value that no longer matches its schema reveals
                // corruption; surface it instead of returning bad data.
                self.schemas
                    .validate(collection, key, &value)
                    .map_err(|v| self.fail(StorageError::Schema(v)))?;
                Some(value)
            }
        };
        self.emit(StorageEvent::Get {
            collection: collection.to_string(),
            key: key.to_string(),
        });
        Ok(value)
    }

    async fn has(&self, collection: &str, key: &str) -> Result<bool, StorageError> {
        self.backend
            .exists(&self.entry_key(collection, key))
            .await
            .map_err(|e| self.fail(e))
    }

    async fn set(&self, collection: &str, key: &str, value: Value) -> Result<(), StorageError> {
        self.schemas
            .validate(collection, key, &value)
            .map_err(|v| self.fail(StorageError::Schema(v)))?;
        let raw = serde_json::to_string(&value)?;
        self.backend
            .set(&self.entry_key(collection, key), &raw)
            .await
            .map_err(|e| self.fail(e))?;
        self.emit(StorageEvent::Set {
            collection: collection.to_string(),
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<bool, StorageError> {
        let removed = self
            .backend
            .del(&self.entry_key(collection, key))
            .await
            .map_err(|e| self.fail(e))?;
        if removed {
            self.emit(StorageEvent::Delete {
                collection: collection.to_string(),
                key: key.to_string(),
            });
        }
        Ok(removed)
    }

    async fn clear(&self, collection: Option<&str>) -> Result<usize, StorageError> {
        let keys = self
            .backend
            .scan(&self.scan_pattern(collection))
            .await
            .map_err(|e| self.fail(e))?;
        let mut removed = 0;
        for key in keys {
            match self.backend.del(&key).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("clear: failed to delete {}: {}", key, e);
                }
            }
        }
        self.emit(StorageEvent::Clear {
            collection: collection.map(str::to_string),
            removed,
        });
        Ok(removed)
    }

    async fn size(&self, collection: Option<&str>) -> Result<usize, StorageError> {
        let keys = self
            .backend
            .scan(&self.scan_pattern(collection))
            .await
            .map_err(|e| self.fail(e))?;
        Ok(keys.len())
    }

    async fn keys(&self, collection: &str) -> Result<Vec<String>, StorageError> {
        let full = self
            .backend
            .scan(&self.scan_pattern(Some(collection)))
            .await
            .map_err(|e| self.fail(e))?;
        let lead = format!("{}:{}:", self.prefix, collection);
        Ok(full
            .iter()
            .filter_map(|k| k.strip_prefix(&lead).map(str::to_string))
            .collect())
    }

    async fn close(&self) {
        // The backend is shared with the bucket manager; nothing to release
        // here. Dropping the adapter drops its event subscribers.
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_core::schema::{FieldType, Schema};

    fn adapter_pair() -> (Arc<MemoryBackend>, NamespacedStorage, NamespacedStorage) {
        let backend = Arc::new(MemoryBackend::new());
        let schemas = Arc::new(SchemaRegistry::new());
        let a = NamespacedStorage::new("user_data:user_a", backend.clone(), schemas.clone());
        let b = NamespacedStorage::new("user_data:user_b", backend.clone(), schemas);
        (backend, a, b)
    }

    #[tokio::test]
    async fn set_get_round_trip() {
        let (_, store, _) = adapter_pair();
        let value = json!({"message": "Hello from client 1!", "timestamp": 1234});
        store.set("test", "data", value.clone()).await.unwrap();
        assert_eq!(store.get("test", "data").await.unwrap(), Some(value));
        assert!(store.has("test", "data").await.unwrap());
    }

    #[tokio::test]
    async fn missing_key_is_none() {
        let (_, store, _) = adapter_pair();
        assert_eq!(store.get("test", "nope").await.unwrap(), None);
        assert!(!store.has("test", "nope").await.unwrap());
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let (_, a, b) = adapter_pair();
        a.set("c", "k", json!("A")).await.unwrap();
        b.set("c", "k", json!("B")).await.unwrap();
        assert_eq!(a.get("c", "k").await.unwrap(), Some(json!("A")));
        assert_eq!(b.get("c", "k").await.unwrap(), Some(json!("B")));
        assert_eq!(a.keys("c").await.unwrap(), vec!["k".to_string()]);
        assert_eq!(b.keys("c").await.unwrap(), vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn delete_removes_exactly_one_key() {
        let (_, store, _) = adapter_pair();
        store.set("c", "k1", json!(1)).await.unwrap();
        store.set("c", "k2", json!(2)).await.unwrap();
        assert!(store.delete("c", "k1").await.unwrap());
        assert!(!store.delete("c", "k1").await.unwrap());
        assert!(!store.has("c", "k1").await.unwrap());
        assert!(!store.keys("c").await.unwrap().contains(&"k1".to_string()));
        assert_eq!(store.size(Some("c")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn clear_scopes_to_collection() {
        let (_, store, _) = adapter_pair();
        store.set("c1", "a", json!(1)).await.unwrap();
        store.set("c1", "b", json!(2)).await.unwrap();
        store.set("c2", "a", json!(3)).await.unwrap();

        assert_eq!(store.clear(Some("c1")).await.unwrap(), 2);
        assert_eq!(store.size(Some("c1")).await.unwrap(), 0);
        assert_eq!(store.size(Some("c2")).await.unwrap(), 1);

        assert_eq!(store.clear(None).await.unwrap(), 1);
        assert_eq!(store.size(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn schema_rejects_write_without_persisting() {
        let backend = Arc::new(MemoryBackend::new());
        let mut schemas = SchemaRegistry::new();
        schemas.register(
            "test",
            "data",
            Schema::object([("message", FieldType::String), ("timestamp", FieldType::Number)]),
        );
        let store = NamespacedStorage::new("user_data:u", backend, Arc::new(schemas));

        let err = store
            .set("test", "data", json!({"message": 42}))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Schema(_)));
        assert_eq!(store.get("test", "data").await.unwrap(), None);
        assert_eq!(store.size(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn corrupted_value_surfaces_on_get() {
        let backend = Arc::new(MemoryBackend::new());
        let mut schemas = SchemaRegistry::new();
        schemas.register("test", "data", Schema::object([("n", FieldType::Number)]));
        let store =
            NamespacedStorage::new("user_data:u", backend.clone(), Arc::new(schemas));

        // Bypass the adapter to simulate corruption in the backing store.
        backend
            .set("user_data:u:test:data", r#"{"n":"oops"}"#)
            .await
            .unwrap();
        assert!(matches!(
            store.get("test", "data").await,
            Err(StorageError::Schema(_))
        ));

        backend.set("user_data:u:test:data", "not json").await.unwrap();
        assert!(matches!(
            store.get("test", "data").await,
            Err(StorageError::Json(_))
        ));
    }

    #[tokio::test]
    async fn local_events_follow_mutations() {
        let (_, store, _) = adapter_pair();
        let mut events = store.subscribe();

        store.set("c", "k", json!(7)).await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            StorageEvent::Set { ref collection, ref key, .. }
                if collection == "c" && key == "k"
        ));

        store.delete("c", "k").await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            StorageEvent::Delete { .. }
        ));

        store.clear(None).await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            StorageEvent::Clear { removed: 0, .. }
        ));
    }
}
