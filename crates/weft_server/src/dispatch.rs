//! Request dispatcher.
//!
//! Routes one authenticated client request to the connection's tenant
//! adapter (or the bucket manager for admin actions), produces exactly one
//! response per request, and broadcasts successful mutations to the rest of
//! the channel. Failed mutations are never broadcast.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use weft_core::protocol::{MutationKind, Request, RequestBody, Response, ServerPush};

use crate::buckets::BucketManager;
use crate::channels::ChannelBroker;
use crate::store::NamespacedStorage;
use weft_core::storage::StorageAdapter;

/// Everything a connection's request loop needs to serve one tenant.
pub struct DispatchContext {
    /// The tenant's scoped adapter.
    pub storage: Arc<NamespacedStorage>,
    /// The server-wide bucket manager, for admin actions.
    pub buckets: Arc<BucketManager>,
    /// The server-wide channel broker.
    pub broker: Arc<ChannelBroker>,
    /// The connection's channel.
    pub channel_id: String,
    /// The connection's id, excluded from its own broadcasts.
    pub conn_id: u64,
}

/// Serve one request. Always returns a response carrying the request's id.
pub async fn dispatch(ctx: &DispatchContext, request: Request) -> Response {
    let id = request.id;
    match handle(ctx, request.body).await {
        Ok(result) => Response::ok(id, result),
        Err(message) => {
            debug!("request {} failed: {}", id, message);
            Response::err(id, message)
        }
    }
}

async fn handle(ctx: &DispatchContext, body: RequestBody) -> Result<Value, String> {
    match body {
        RequestBody::Get { collection, key } => {
            let value = ctx
                .storage
                .get(&collection, &key)
                .await
                .map_err(|e| e.to_string())?;
            Ok(json!({
                "collection": collection,
                "key": key,
                "value": value.unwrap_or(Value::Null),
            }))
        }

        RequestBody::Set {
            collection,
            key,
            value,
        } => {
            ctx.storage
                .set(&collection, &key, value.clone())
                .await
                .map_err(|e| e.to_string())?;
            ctx.broker
                .broadcast(
                    &ctx.channel_id,
                    ServerPush::Event {
                        event: MutationKind::Set,
                        collection: collection.clone(),
                        key: Some(key.clone()),
                        value: Some(value),
                    },
                    ctx.conn_id,
                )
                .await;
            Ok(json!({"collection": collection, "key": key}))
        }

        RequestBody::Delete { collection, key } => {
            let success = ctx
                .storage
                .delete(&collection, &key)
                .await
                .map_err(|e| e.to_string())?;
            if success {
                ctx.broker
                    .broadcast(
                        &ctx.channel_id,
                        ServerPush::Event {
                            event: MutationKind::Delete,
                            collection,
                            key: Some(key),
                            value: None,
                        },
                        ctx.conn_id,
                    )
                    .await;
            }
            Ok(json!({"success": success}))
        }

        RequestBody::Clear { collection } => {
            let count = ctx
                .storage
                .clear(collection.as_deref())
                .await
                .map_err(|e| e.to_string())?;
            ctx.broker
                .broadcast(
                    &ctx.channel_id,
                    ServerPush::Event {
                        event: MutationKind::Clear,
                        collection: collection.unwrap_or_else(|| "all".to_string()),
                        key: None,
                        value: None,
                    },
                    ctx.conn_id,
                )
                .await;
            Ok(json!({"count": count}))
        }

        RequestBody::Size { collection } => {
            let size = ctx
                .storage
                .size(collection.as_deref())
                .await
                .map_err(|e| e.to_string())?;
            Ok(json!({"size": size}))
        }

        RequestBody::Keys { collection } => {
            let keys = ctx
                .storage
                .keys(&collection)
                .await
                .map_err(|e| e.to_string())?;
            Ok(json!({"keys": keys}))
        }

        RequestBody::AdminListUsers => {
            let users: Vec<Value> = ctx
                .buckets
                .list_users()
                .await
                .into_iter()
                .map(|meta| json!({"userId": meta.user_id, "metadata": meta}))
                .collect();
            Ok(json!({"users": users}))
        }

        RequestBody::AdminDeleteUser { user_id } => {
            let success = ctx
                .buckets
                .delete_user_bucket(&user_id)
                .await
                .map_err(|e| e.to_string())?;
            Ok(json!({"success": success}))
        }

        RequestBody::AdminUserInfo { user_id } => {
            match ctx
                .buckets
                .get_user_metadata(&user_id)
                .await
                .map_err(|e| e.to_string())?
            {
                Some(meta) => Ok(json!({"userId": user_id, "metadata": meta})),
                None => Err(format!("Unknown user: {}", user_id)),
            }
        }
    }
}
