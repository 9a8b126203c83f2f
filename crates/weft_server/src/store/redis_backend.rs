//! Redis backing store.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, IntoConnectionInfo};
use tracing::info;

use weft_core::storage::StorageError;

use super::KvBackend;

fn backend_err(e: redis::RedisError) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// A [`KvBackend`] over a shared Redis connection.
///
/// [`ConnectionManager`] multiplexes one connection, reconnects on failure,
/// and is cheap to clone, so a single backend serves every tenant adapter.
#[derive(Clone)]
pub struct RedisBackend {
    manager: ConnectionManager,
}

impl RedisBackend {
    /// Connect to a Redis URL, selecting the given database index.
    pub async fn connect(url: &str, database: u32) -> Result<Self, StorageError> {
        let mut info = url
            .into_connection_info()
            .map_err(|e| StorageError::Backend(format!("invalid redis url: {}", e)))?;
        info.redis.db = database as i64;
        let client = redis::Client::open(info).map_err(backend_err)?;
        let manager = ConnectionManager::new(client).await.map_err(backend_err)?;
        info!("connected to redis at {} (db {})", url, database);
        Ok(Self { manager })
    }
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut con = self.manager.clone();
        con.get(key).await.map_err(backend_err)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut con = self.manager.clone();
        con.set::<_, _, ()>(key, value).await.map_err(backend_err)
    }

    async fn del(&self, key: &str) -> Result<bool, StorageError> {
        let mut con = self.manager.clone();
        let removed: i64 = con.del(key).await.map_err(backend_err)?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let mut con = self.manager.clone();
        con.exists(key).await.map_err(backend_err)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        // Cursor-based SCAN rather than KEYS: same best-effort snapshot,
        // no full keyspace sweep blocking the server.
        let mut con = self.manager.clone();
        let mut iter = con
            .scan_match::<_, String>(pattern)
            .await
            .map_err(backend_err)?;
        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StorageError> {
        let mut con = self.manager.clone();
        con.sadd::<_, _, ()>(key, member).await.map_err(backend_err)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StorageError> {
        let mut con = self.manager.clone();
        con.srem::<_, _, ()>(key, member).await.map_err(backend_err)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StorageError> {
        let mut con = self.manager.clone();
        con.smembers(key).await.map_err(backend_err)
    }
}
