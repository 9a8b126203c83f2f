//! Wire frame types.
//!
//! Every frame is a single JSON object carried in one transport message.
//! Handshake frames travel in the clear; once the session key is
//! established, frame bodies are sealed with [`crate::crypto::seal`] and the
//! wire carries the base64 string instead of bare JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The one frame a client may send before encryption is established.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientHello {
    /// Opens the handshake with the shared token.
    Hello {
        /// The tenant/channel token.
        token: String,
    },
}

/// Unencrypted server frames during the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerHandshake {
    /// Acknowledges the hello and names the broadcast channel.
    Hello {
        /// Channel id, `channel_<16 hex>`.
        #[serde(rename = "channelId")]
        channel_id: String,
    },
    /// Delivers the wrapped session key and the session IV.
    Encryption {
        /// `base64(iv || tag || ct)` of the session key, sealed under the
        /// token-derived secret.
        #[serde(rename = "encryptionKey")]
        encryption_key: String,
        /// Base64 of the 16-byte session IV.
        iv: String,
    },
    /// Terminal handshake error.
    Error {
        /// Single-line message.
        error: String,
    },
}

/// The operations a client may request, tagged by `action`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RequestBody {
    /// Read one value.
    Get {
        /// Collection name.
        collection: String,
        /// Key within the collection.
        key: String,
    },
    /// Write one value.
    Set {
        /// Collection name.
        collection: String,
        /// Key within the collection.
        key: String,
        /// The value to store.
        value: Value,
    },
    /// Remove one value.
    Delete {
        /// Collection name.
        collection: String,
        /// Key within the collection.
        key: String,
    },
    /// Remove every key in a collection, or everything when omitted.
    Clear {
        /// Collection name, or `None` for all collections.
        #[serde(skip_serializing_if = "Option::is_none")]
        collection: Option<String>,
    },
    /// Count keys in a collection, or across all collections when omitted.
    Size {
        /// Collection name, or `None` for all collections.
        #[serde(skip_serializing_if = "Option::is_none")]
        collection: Option<String>,
    },
    /// List the key names of a collection.
    Keys {
        /// Collection name.
        collection: String,
    },
    /// Enumerate known tenants.
    AdminListUsers,
    /// Delete a tenant and its data.
    AdminDeleteUser {
        /// Tenant id.
        #[serde(rename = "userId")]
        user_id: String,
    },
    /// Fetch one tenant's metadata.
    AdminUserInfo {
        /// Tenant id.
        #[serde(rename = "userId")]
        user_id: String,
    },
}

/// An encrypted client request: a correlation id plus the operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Client-chosen correlation id; echoed on the response.
    pub id: String,
    /// The requested operation.
    #[serde(flatten)]
    pub body: RequestBody,
}

/// Response to one request. Exactly one of `result` / `error` is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Correlation id of the request this answers.
    pub id: String,
    /// Operation result on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Single-line message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// A success response.
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    /// An error response.
    pub fn err(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error.into()),
        }
    }
}

/// The kind of mutation an event frame announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    /// A value was written.
    Set,
    /// A value was removed.
    Delete,
    /// A collection (or everything) was cleared.
    Clear,
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationKind::Set => write!(f, "set"),
            MutationKind::Delete => write!(f, "delete"),
            MutationKind::Clear => write!(f, "clear"),
        }
    }
}

/// Unsolicited server frames after authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerPush {
    /// A mutation by another connection on the same channel.
    Event {
        /// What happened.
        event: MutationKind,
        /// Collection the mutation touched, or `"all"` for a full clear.
        collection: String,
        /// Key for set/delete events.
        #[serde(skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        /// New value for set events.
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },
    /// An error not tied to any request id.
    Error {
        /// Single-line message.
        error: String,
    },
}
