//! The storage-adapter contract.
//!
//! Every backend (the server's namespaced Redis adapter, the remote
//! WebSocket adapter) exposes the same async key-value surface over
//! `collection × key` and the same in-process event stream. Events are
//! fire-and-forget: subscribers that fall behind lose old events rather
//! than applying backpressure to the adapter.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::protocol::MutationKind;
use crate::schema::SchemaViolation;

/// Capacity of an adapter's local event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Errors surfaced by storage operations.
#[derive(Debug)]
pub enum StorageError {
    /// The backing store failed (network, protocol, server-side error).
    Backend(String),
    /// A value failed its slot's schema.
    Schema(SchemaViolation),
    /// A stored value could not be serialized or deserialized.
    Json(serde_json::Error),
    /// The transport is closed; the operation was never sent.
    ConnectionClosed,
    /// No response arrived within the request timeout. The server may still
    /// have applied the mutation.
    Timeout,
    /// The server answered the request with an error.
    Server(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Backend(e) => write!(f, "backend error: {}", e),
            StorageError::Schema(v) => write!(f, "schema validation failed: {}", v),
            StorageError::Json(e) => write!(f, "serialization error: {}", e),
            StorageError::ConnectionClosed => write!(f, "connection closed"),
            StorageError::Timeout => write!(f, "request timed out"),
            StorageError::Server(e) => write!(f, "server error: {}", e),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Json(e)
    }
}

impl From<SchemaViolation> for StorageError {
    fn from(v: SchemaViolation) -> Self {
        StorageError::Schema(v)
    }
}

/// Events emitted on an adapter's local channel.
///
/// `Connected` / `Disconnected` / `Remote` are only raised by
/// transport-backed adapters.
#[derive(Debug, Clone)]
pub enum StorageEvent {
    /// A value was read through this adapter.
    Get {
        /// Collection name.
        collection: String,
        /// Key name.
        key: String,
    },
    /// A value was written through this adapter.
    Set {
        /// Collection name.
        collection: String,
        /// Key name.
        key: String,
        /// The stored value.
        value: Value,
    },
    /// A value was removed through this adapter.
    Delete {
        /// Collection name.
        collection: String,
        /// Key name.
        key: String,
    },
    /// A collection (or everything) was cleared through this adapter.
    Clear {
        /// Collection name, `None` for a full clear.
        collection: Option<String>,
        /// How many entries were removed.
        removed: usize,
    },
    /// An operation failed.
    Error {
        /// Single-line message.
        message: String,
    },
    /// The transport finished its handshake.
    Connected,
    /// The transport dropped.
    Disconnected,
    /// Another connection on the same channel mutated the store.
    Remote {
        /// What happened.
        kind: MutationKind,
        /// Collection the mutation touched, `"all"` for a full clear.
        collection: String,
        /// Key for set/delete mutations.
        key: Option<String>,
        /// New value for set mutations.
        value: Option<Value>,
    },
}

/// Uniform async key-value contract over collections.
///
/// Keys are unique within a `(tenant, collection)`; ordering is irrelevant.
/// Implementations validate writes (and reads) against the schemas supplied
/// at construction.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Returns the stored, schema-validated value, or `None` if absent.
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StorageError>;

    /// Whether a value exists for the key.
    async fn has(&self, collection: &str, key: &str) -> Result<bool, StorageError>;

    /// Validate and persist a value.
    ///
    /// If a schema is registered for the slot and the value fails it, the
    /// write is rejected and nothing is persisted.
    async fn set(&self, collection: &str, key: &str, value: Value) -> Result<(), StorageError>;

    /// Remove one value. Returns whether a value was removed.
    async fn delete(&self, collection: &str, key: &str) -> Result<bool, StorageError>;

    /// Remove every key in a collection, or every collection when `None`.
    /// Returns the number of entries removed.
    async fn clear(&self, collection: Option<&str>) -> Result<usize, StorageError>;

    /// Count keys in a collection, or across all collections when `None`.
    async fn size(&self, collection: Option<&str>) -> Result<usize, StorageError>;

    /// The key names of a collection, unordered.
    async fn keys(&self, collection: &str) -> Result<Vec<String>, StorageError>;

    /// Release resources and drop all local event subscribers.
    async fn close(&self);

    /// Subscribe to this adapter's local events.
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;
}
