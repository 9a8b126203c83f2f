//! Per-tenant bucket management.
//!
//! Every token maps deterministically to a tenant id; every tenant owns an
//! isolated key prefix on the shared backing store plus a metadata record.
//! The manager keeps a cache of tenant metadata and of the scoped adapters
//! it hands to connections, and maintains the `all_users` index so tenants
//! survive restarts.
//!
//! Persistent layout:
//! - `all_users`: set of every known tenant id
//! - `user_metadata:{tenant}`: JSON metadata record
//! - `user_data:{tenant}:{collection}:{key}`: tenant data

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use weft_core::crypto::derive_tenant_id;
use weft_core::schema::SchemaRegistry;
use weft_core::storage::{StorageAdapter, StorageError};

use crate::store::{KvBackend, NamespacedStorage};

const ALL_USERS_KEY: &str = "all_users";
const METADATA_PREFIX: &str = "user_metadata:";
const DATA_PREFIX: &str = "user_data:";

/// A tenant's persistent metadata record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantMetadata {
    /// The tenant id (`user_<16 hex>`).
    #[serde(rename = "userId")]
    pub user_id: String,
    /// Creation time, ms since the epoch.
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    /// Last handshake or bucket access, ms since the epoch.
    #[serde(rename = "lastAccessedAt")]
    pub last_accessed_at: i64,
    /// Whether the tenant is active.
    #[serde(rename = "isActive")]
    pub is_active: bool,
}

/// Maps tokens to isolated tenant buckets on a shared backing store.
pub struct BucketManager {
    backend: Arc<dyn KvBackend>,
    schemas: Arc<SchemaRegistry>,
    buckets: RwLock<HashMap<String, Arc<NamespacedStorage>>>,
    metadata: RwLock<HashMap<String, TenantMetadata>>,
}

impl BucketManager {
    /// Create a manager over a backend, applying `schemas` to every tenant
    /// adapter it produces.
    pub fn new(backend: Arc<dyn KvBackend>, schemas: Arc<SchemaRegistry>) -> Self {
        Self {
            backend,
            schemas,
            buckets: RwLock::new(HashMap::new()),
            metadata: RwLock::new(HashMap::new()),
        }
    }

    fn metadata_key(tenant_id: &str) -> String {
        format!("{}{}", METADATA_PREFIX, tenant_id)
    }

    fn data_prefix(tenant_id: &str) -> String {
        format!("{}{}", DATA_PREFIX, tenant_id)
    }

    fn make_adapter(&self, tenant_id: &str) -> NamespacedStorage {
        NamespacedStorage::new(
            Self::data_prefix(tenant_id),
            self.backend.clone(),
            self.schemas.clone(),
        )
    }

    /// Hydrate the metadata cache from the `all_users` index.
    ///
    /// Tenants whose metadata fails to parse are logged and skipped; a
    /// corrupt record must not keep the server from starting.
    pub async fn initialize(&self) -> Result<(), StorageError> {
        let tenant_ids = self.backend.set_members(ALL_USERS_KEY).await?;
        let mut cache = self.metadata.write().await;
        for tenant_id in &tenant_ids {
            match self.backend.get(&Self::metadata_key(tenant_id)).await? {
                Some(raw) => match serde_json::from_str::<TenantMetadata>(&raw) {
                    Ok(meta) => {
                        cache.insert(tenant_id.clone(), meta);
                    }
                    Err(e) => {
                        warn!("skipping tenant {} with invalid metadata: {}", tenant_id, e);
                    }
                },
                None => {
                    warn!("skipping tenant {} with missing metadata", tenant_id);
                }
            }
        }
        info!("loaded {} tenant(s)", cache.len());
        Ok(())
    }

    /// Number of tenants currently known.
    pub async fn user_count(&self) -> usize {
        self.metadata.read().await.len()
    }

    async fn persist_metadata(&self, meta: &TenantMetadata) -> Result<(), StorageError> {
        let raw = serde_json::to_string(meta)?;
        self.backend
            .set(&Self::metadata_key(&meta.user_id), &raw)
            .await
    }

    /// The adapter for a token's tenant, creating the tenant on first use.
    ///
    /// Updates `lastAccessedAt` on every call.
    pub async fn ensure_user_bucket(
        &self,
        token: &str,
    ) -> Result<Arc<NamespacedStorage>, StorageError> {
        let tenant_id = derive_tenant_id(token);
        let now = Utc::now().timestamp_millis();

        let meta = {
            let mut cache = self.metadata.write().await;
            match cache.get_mut(&tenant_id) {
                Some(meta) => {
                    meta.last_accessed_at = now;
                    meta.clone()
                }
                None => {
                    let meta = TenantMetadata {
                        user_id: tenant_id.clone(),
                        created_at: now,
                        last_accessed_at: now,
                        is_active: true,
                    };
                    cache.insert(tenant_id.clone(), meta.clone());
                    info!("created tenant {}", tenant_id);
                    meta
                }
            }
        };
        self.persist_metadata(&meta).await?;
        self.backend.set_add(ALL_USERS_KEY, &tenant_id).await?;

        // Double-checked create, same discipline as the metadata above.
        {
            let buckets = self.buckets.read().await;
            if let Some(adapter) = buckets.get(&tenant_id) {
                return Ok(adapter.clone());
            }
        }
        let mut buckets = self.buckets.write().await;
        if let Some(adapter) = buckets.get(&tenant_id) {
            return Ok(adapter.clone());
        }
        let adapter = Arc::new(self.make_adapter(&tenant_id));
        buckets.insert(tenant_id, adapter.clone());
        Ok(adapter)
    }

    /// The adapter for a token's tenant, only if the tenant already exists.
    pub async fn get_user_bucket(
        &self,
        token: &str,
    ) -> Result<Option<Arc<NamespacedStorage>>, StorageError> {
        let tenant_id = derive_tenant_id(token);
        let known = self.metadata.read().await.contains_key(&tenant_id)
            || self
                .backend
                .exists(&Self::metadata_key(&tenant_id))
                .await?;
        if !known {
            return Ok(None);
        }

        {
            let buckets = self.buckets.read().await;
            if let Some(adapter) = buckets.get(&tenant_id) {
                return Ok(Some(adapter.clone()));
            }
        }
        let mut buckets = self.buckets.write().await;
        let adapter = buckets
            .entry(tenant_id.clone())
            .or_insert_with(|| Arc::new(self.make_adapter(&tenant_id)))
            .clone();
        Ok(Some(adapter))
    }

    /// Remove a tenant: its data, its metadata record, and its index entry.
    ///
    /// Returns whether the tenant existed.
    pub async fn delete_user_bucket(&self, tenant_id: &str) -> Result<bool, StorageError> {
        let cached = self.metadata.write().await.remove(tenant_id).is_some();
        let persisted = self
            .backend
            .exists(&Self::metadata_key(tenant_id))
            .await?;
        if !cached && !persisted {
            debug!("delete of unknown tenant {}", tenant_id);
            return Ok(false);
        }

        let adapter = self.make_adapter(tenant_id);
        let removed = adapter.clear(None).await?;
        debug!("cleared {} entries for tenant {}", removed, tenant_id);

        self.backend.del(&Self::metadata_key(tenant_id)).await?;
        self.backend.set_remove(ALL_USERS_KEY, tenant_id).await?;
        self.buckets.write().await.remove(tenant_id);
        info!("deleted tenant {}", tenant_id);
        Ok(true)
    }

    /// One tenant's metadata, if known.
    pub async fn get_user_metadata(
        &self,
        tenant_id: &str,
    ) -> Result<Option<TenantMetadata>, StorageError> {
        if let Some(meta) = self.metadata.read().await.get(tenant_id) {
            return Ok(Some(meta.clone()));
        }
        match self.backend.get(&Self::metadata_key(tenant_id)).await? {
            Some(raw) => {
                let meta: TenantMetadata = serde_json::from_str(&raw)?;
                self.metadata
                    .write()
                    .await
                    .insert(tenant_id.to_string(), meta.clone());
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    /// Every known tenant's metadata.
    pub async fn list_users(&self) -> Vec<TenantMetadata> {
        let mut users: Vec<_> = self.metadata.read().await.values().cloned().collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }
}
