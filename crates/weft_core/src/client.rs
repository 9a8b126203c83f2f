//! Remote storage adapter.
//!
//! [`RemoteStorage`] implements the [`StorageAdapter`] contract over one
//! long-lived encrypted WebSocket to a fabric server. It multiplexes typed
//! request/response RPCs over the connection via a pending-request table,
//! surfaces the server's broadcast frames as local [`StorageEvent::Remote`]
//! events, and reconnects with a bounded fixed-interval retry on unexpected
//! disconnects.
//!
//! The adapter does not cache: every read goes to the server, and `remote`
//! events carry data without updating any local state.
//!
//! Requests time out after [`RemoteStorageConfig::request_timeout`]. A
//! timeout rejects the local waiter but does not cancel the server-side
//! work; the server may still apply the mutation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::crypto::{self, SESSION_KEY_LEN};
use crate::protocol::{ClientHello, Request, RequestBody, Response, ServerHandshake, ServerPush};
use crate::storage::{StorageAdapter, StorageError, StorageEvent, EVENT_CHANNEL_CAPACITY};
use crate::transport::{MessageTransport, TokioConnector, TransportConnector, WsMessage};

/// How long the client waits for the two-frame server handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for a [`RemoteStorage`] adapter.
#[derive(Debug, Clone)]
pub struct RemoteStorageConfig {
    /// Server URL, e.g. `ws://localhost:3000/ws`.
    pub url: String,
    /// The tenant/channel token.
    pub token: String,
    /// Delay between reconnect attempts.
    pub reconnect_interval: Duration,
    /// Reconnect attempts before the adapter gives up.
    pub max_reconnect_attempts: u32,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl RemoteStorageConfig {
    /// Config with the default reconnect and timeout policy.
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            reconnect_interval: Duration::from_millis(1000),
            max_reconnect_attempts: 10,
            request_timeout: Duration::from_secs(5),
        }
    }
}

enum Command {
    Request {
        body: RequestBody,
        resp: oneshot::Sender<Result<Value, StorageError>>,
    },
    Close,
}

/// Storage adapter backed by a fabric server over an encrypted WebSocket.
pub struct RemoteStorage {
    cmd_tx: mpsc::Sender<Command>,
    events: broadcast::Sender<StorageEvent>,
    ready_rx: watch::Receiver<bool>,
    channel_id: Arc<Mutex<Option<String>>>,
    closing: Arc<AtomicBool>,
    request_timeout: Duration,
}

impl RemoteStorage {
    /// Open an adapter over tokio-tungstenite.
    ///
    /// Returns immediately; the connection is established in the background
    /// and requests queue until the handshake completes.
    pub fn connect(config: RemoteStorageConfig) -> Self {
        Self::connect_with(config, TokioConnector)
    }

    /// Open an adapter over a custom transport connector.
    pub fn connect_with<C>(config: RemoteStorageConfig, connector: C) -> Self
    where
        C: TransportConnector + 'static,
        C::Transport: 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = watch::channel(false);
        let channel_id = Arc::new(Mutex::new(None));
        let closing = Arc::new(AtomicBool::new(false));
        let request_timeout = config.request_timeout;

        tokio::spawn(run_connection(
            config,
            connector,
            cmd_rx,
            events.clone(),
            ready_tx,
            channel_id.clone(),
            closing.clone(),
        ));

        Self {
            cmd_tx,
            events,
            ready_rx,
            channel_id,
            closing,
            request_timeout,
        }
    }

    /// Wait until the connection is authenticated.
    pub async fn ready(&self) {
        let mut rx = self.ready_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// The channel id assigned by the server, once authenticated.
    pub fn channel_id(&self) -> Option<String> {
        self.channel_id.lock().expect("channel id lock").clone()
    }

    async fn request(&self, body: RequestBody) -> Result<Value, StorageError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(StorageError::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Request { body, resp: tx })
            .await
            .map_err(|_| StorageError::ConnectionClosed)?;
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StorageError::ConnectionClosed),
            Err(_) => Err(StorageError::Timeout),
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
impl StorageAdapter for RemoteStorage {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StorageError> {
        let result = self
            .request(RequestBody::Get {
                collection: collection.to_string(),
                key: key.to_string(),
            })
            .await
            .map_err(|e| self.fail(e))?;
        self.emit(StorageEvent::Get {
            collection: collection.to_string(),
            key: key.to_string(),
        });
        Ok(match result.get("value") {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.clone()),
        })
    }

    async fn has(&self, collection: &str, key: &str) -> Result<bool, StorageError> {
        let result = self
            .request(RequestBody::Get {
                collection: collection.to_string(),
                key: key.to_string(),
            })
            .await
            .map_err(|e| self.fail(e))?;
        Ok(!matches!(result.get("value"), None | Some(Value::Null)))
    }

    async fn set(&self, collection: &str, key: &str, value: Value) -> Result<(), StorageError> {
        self.request(RequestBody::Set {
            collection: collection.to_string(),
            key: key.to_string(),
            value: value.clone(),
        })
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
        let result = self
            .request(RequestBody::Delete {
                collection: collection.to_string(),
                key: key.to_string(),
            })
            .await
            .map_err(|e| self.fail(e))?;
        let removed = result
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if removed {
            self.emit(StorageEvent::Delete {
                collection: collection.to_string(),
                key: key.to_string(),
            });
        }
        Ok(removed)
    }

    async fn clear(&self, collection: Option<&str>) -> Result<usize, StorageError> {
        let result = self
            .request(RequestBody::Clear {
                collection: collection.map(str::to_string),
            })
            .await
            .map_err(|e| self.fail(e))?;
        let removed = result.get("count").and_then(Value::as_u64).unwrap_or(0) as usize;
        self.emit(StorageEvent::Clear {
            collection: collection.map(str::to_string),
            removed,
        });
        Ok(removed)
    }

    async fn size(&self, collection: Option<&str>) -> Result<usize, StorageError> {
        let result = self
            .request(RequestBody::Size {
                collection: collection.map(str::to_string),
            })
            .await
            .map_err(|e| self.fail(e))?;
        Ok(result.get("size").and_then(Value::as_u64).unwrap_or(0) as usize)
    }

    async fn keys(&self, collection: &str) -> Result<Vec<String>, StorageError> {
        let result = self
            .request(RequestBody::Keys {
                collection: collection.to_string(),
            })
            .await
            .map_err(|e| self.fail(e))?;
        Ok(result
            .get("keys")
            .and_then(Value::as_array)
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| k.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.cmd_tx.send(Command::Close).await;
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}

/// Admin operations, available to any authenticated connection.
impl RemoteStorage {
    /// Enumerate known tenants as `{userId, metadata}` objects.
    pub async fn admin_list_users(&self) -> Result<Vec<Value>, StorageError> {
        let result = self.request(RequestBody::AdminListUsers).await?;
        Ok(result
            .get("users")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Delete a tenant and its data. Returns whether the tenant existed.
    pub async fn admin_delete_user(&self, user_id: &str) -> Result<bool, StorageError> {
        let result = self
            .request(RequestBody::AdminDeleteUser {
                user_id: user_id.to_string(),
            })
            .await?;
        Ok(result
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    /// Fetch one tenant's metadata.
    pub async fn admin_user_info(&self, user_id: &str) -> Result<Value, StorageError> {
        self.request(RequestBody::AdminUserInfo {
            user_id: user_id.to_string(),
        })
        .await
    }
}

struct Session {
    key: [u8; SESSION_KEY_LEN],
}

enum SessionEnd {
    /// `close()` was called or every handle dropped.
    Closed,
    /// The transport died; the reconnect policy applies.
    Dropped,
}

#[allow(clippy::too_many_arguments)]
async fn run_connection<C>(
    config: RemoteStorageConfig,
    connector: C,
    mut cmd_rx: mpsc::Receiver<Command>,
    events: broadcast::Sender<StorageEvent>,
    ready_tx: watch::Sender<bool>,
    channel_id: Arc<Mutex<Option<String>>>,
    closing: Arc<AtomicBool>,
) where
    C: TransportConnector,
{
    let secret = crypto::derive_token_secret(&config.token);
    let mut attempt = 0u32;

    while !closing.load(Ordering::SeqCst) {
        if attempt > 0 {
            if attempt > config.max_reconnect_attempts {
                log::warn!("[RemoteStorage] max reconnect attempts reached, giving up");
                break;
            }
            log::info!(
                "[RemoteStorage] reconnecting in {:?} (attempt {}/{})",
                config.reconnect_interval,
                attempt,
                config.max_reconnect_attempts
            );
            tokio::time::sleep(config.reconnect_interval).await;
            if closing.load(Ordering::SeqCst) {
                break;
            }
        }

        let mut transport = match connector.connect(&config.url).await {
            Ok(t) => t,
            Err(e) => {
                log::warn!("[RemoteStorage] connection failed: {}", e);
                let _ = events.send(StorageEvent::Error {
                    message: format!("connection failed: {}", e),
                });
                attempt += 1;
                continue;
            }
        };

        let session = match handshake(&mut transport, &config.token, &secret, &channel_id).await {
            Ok(s) => s,
            Err(e) => {
                log::warn!("[RemoteStorage] handshake failed: {}", e);
                let _ = events.send(StorageEvent::Error {
                    message: format!("handshake failed: {}", e),
                });
                let _ = transport.close().await;
                attempt += 1;
                continue;
            }
        };

        attempt = 0;
        ready_tx.send_replace(true);
        let _ = events.send(StorageEvent::Connected);
        log::info!("[RemoteStorage] authenticated");

        let mut pending: HashMap<String, oneshot::Sender<Result<Value, StorageError>>> =
            HashMap::new();
        let end = run_session(&mut transport, &session, &mut cmd_rx, &events, &mut pending).await;

        ready_tx.send_replace(false);
        for (_, waiter) in pending.drain() {
            let _ = waiter.send(Err(StorageError::ConnectionClosed));
        }
        let _ = transport.close().await;
        let _ = events.send(StorageEvent::Disconnected);

        match end {
            SessionEnd::Closed => break,
            SessionEnd::Dropped => attempt += 1,
        }
    }

    // Reject anything still queued so waiters fail fast instead of timing out.
    cmd_rx.close();
    while let Some(cmd) = cmd_rx.recv().await {
        if let Command::Request { resp, .. } = cmd {
            let _ = resp.send(Err(StorageError::ConnectionClosed));
        }
    }
}

async fn handshake<T: MessageTransport>(
    transport: &mut T,
    token: &str,
    secret: &[u8; SESSION_KEY_LEN],
    channel_id: &Mutex<Option<String>>,
) -> Result<Session, StorageError> {
    let hello = serde_json::to_string(&ClientHello::Hello {
        token: token.to_string(),
    })?;
    transport
        .send_text(hello)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    loop {
        let msg = tokio::time::timeout_at(deadline, transport.recv())
            .await
            .map_err(|_| StorageError::Timeout)?;
        match msg {
            Some(Ok(WsMessage::Text(text))) => {
                match serde_json::from_str::<ServerHandshake>(&text) {
                    Ok(ServerHandshake::Hello { channel_id: id }) => {
                        *channel_id.lock().expect("channel id lock") = Some(id);
                    }
                    Ok(ServerHandshake::Encryption { encryption_key, .. }) => {
                        let key = crypto::unwrap_session_key(secret, &encryption_key)
                            .map_err(|e| StorageError::Backend(e.to_string()))?;
                        return Ok(Session { key });
                    }
                    Ok(ServerHandshake::Error { error }) => {
                        return Err(StorageError::Server(error));
                    }
                    Err(e) => {
                        log::debug!("[RemoteStorage] unexpected handshake frame: {}", e);
                    }
                }
            }
            Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {}
            Some(Ok(WsMessage::Binary(_))) => {}
            Some(Ok(WsMessage::Close(_))) | None => {
                return Err(StorageError::ConnectionClosed);
            }
            Some(Err(e)) => {
                return Err(StorageError::Backend(e.to_string()));
            }
        }
    }
}

async fn run_session<T: MessageTransport>(
    transport: &mut T,
    session: &Session,
    cmd_rx: &mut mpsc::Receiver<Command>,
    events: &broadcast::Sender<StorageEvent>,
    pending: &mut HashMap<String, oneshot::Sender<Result<Value, StorageError>>>,
) -> SessionEnd {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None | Some(Command::Close) => return SessionEnd::Closed,
                Some(Command::Request { body, resp }) => {
                    let id = uuid::Uuid::new_v4().to_string();
                    let request = Request { id: id.clone(), body };
                    let json = match serde_json::to_string(&request) {
                        Ok(j) => j,
                        Err(e) => {
                            let _ = resp.send(Err(StorageError::Json(e)));
                            continue;
                        }
                    };
                    let frame = match crypto::seal(&session.key, json.as_bytes()) {
                        Ok(f) => f,
                        Err(e) => {
                            let _ = resp.send(Err(StorageError::Backend(e.to_string())));
                            continue;
                        }
                    };
                    match transport.send_text(frame).await {
                        Ok(()) => {
                            pending.insert(id, resp);
                        }
                        Err(e) => {
                            let _ = resp.send(Err(StorageError::Backend(e.to_string())));
                            return SessionEnd::Dropped;
                        }
                    }
                }
            },
            msg = transport.recv() => match msg {
                Some(Ok(WsMessage::Text(frame))) => {
                    handle_frame(&session.key, &frame, events, pending);
                }
                Some(Ok(WsMessage::Ping(_)))
                | Some(Ok(WsMessage::Pong(_)))
                | Some(Ok(WsMessage::Binary(_))) => {}
                Some(Ok(WsMessage::Close(_))) | None => return SessionEnd::Dropped,
                Some(Err(e)) => {
                    log::warn!("[RemoteStorage] transport error: {}", e);
                    let _ = events.send(StorageEvent::Error {
                        message: e.to_string(),
                    });
                    return SessionEnd::Dropped;
                }
            },
        }
    }
}

fn handle_frame(
    key: &[u8; SESSION_KEY_LEN],
    frame: &str,
    events: &broadcast::Sender<StorageEvent>,
    pending: &mut HashMap<String, oneshot::Sender<Result<Value, StorageError>>>,
) {
    let plaintext = match crypto::open(key, frame) {
        Ok(p) => p,
        Err(e) => {
            // Not valid ciphertext under the session key: drop the frame,
            // keep the connection.
            log::warn!("[RemoteStorage] dropping undecryptable frame: {}", e);
            let _ = events.send(StorageEvent::Error {
                message: format!("undecryptable frame: {}", e),
            });
            return;
        }
    };
    let text = match String::from_utf8(plaintext) {
        Ok(t) => t,
        Err(_) => {
            log::warn!("[RemoteStorage] dropping non-utf8 frame");
            return;
        }
    };

    if let Ok(push) = serde_json::from_str::<ServerPush>(&text) {
        match push {
            ServerPush::Event {
                event,
                collection,
                key,
                value,
            } => {
                let _ = events.send(StorageEvent::Remote {
                    kind: event,
                    collection,
                    key,
                    value,
                });
            }
            ServerPush::Error { error } => {
                let _ = events.send(StorageEvent::Error { message: error });
            }
        }
        return;
    }

    match serde_json::from_str::<Response>(&text) {
        Ok(response) => {
            if let Some(waiter) = pending.remove(&response.id) {
                let outcome = match response.error {
                    Some(error) => Err(StorageError::Server(error)),
                    None => Ok(response.result.unwrap_or(Value::Null)),
                };
                let _ = waiter.send(outcome);
            } else {
                log::debug!(
                    "[RemoteStorage] response for unknown or timed-out request {}",
                    response.id
                );
            }
        }
        Err(e) => {
            log::debug!("[RemoteStorage] unrecognized frame: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The full client/server path is exercised end-to-end in the server
    // crate's integration tests; here we only pin down frame routing.

    #[test]
    fn response_routing_resolves_and_rejects() {
        let key = crypto::generate_session_key();
        let (events, _) = broadcast::channel(8);
        let mut pending = HashMap::new();

        let (tx, mut rx) = oneshot::channel();
        pending.insert("req-1".to_string(), tx);
        let frame = crypto::seal(
            &key,
            br#"{"id":"req-1","result":{"size":2}}"#,
        )
        .unwrap();
        handle_frame(&key, &frame, &events, &mut pending);
        assert!(pending.is_empty());
        let value = rx.try_recv().unwrap().unwrap();
        assert_eq!(value["size"], 2);

        let (tx, mut rx) = oneshot::channel();
        pending.insert("req-2".to_string(), tx);
        let frame = crypto::seal(&key, br#"{"id":"req-2","error":"no such key"}"#).unwrap();
        handle_frame(&key, &frame, &events, &mut pending);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(StorageError::Server(ref msg)) if msg == "no such key"
        ));
    }

    #[test]
    fn event_frames_surface_as_remote() {
        let key = crypto::generate_session_key();
        let (events, mut events_rx) = broadcast::channel(8);
        let mut pending = HashMap::new();

        let frame = crypto::seal(
            &key,
            br#"{"type":"event","event":"set","collection":"test","key":"data","value":41}"#,
        )
        .unwrap();
        handle_frame(&key, &frame, &events, &mut pending);
        match events_rx.try_recv().unwrap() {
            StorageEvent::Remote {
                kind,
                collection,
                key,
                value,
            } => {
                assert_eq!(kind, crate::protocol::MutationKind::Set);
                assert_eq!(collection, "test");
                assert_eq!(key.as_deref(), Some("data"));
                assert_eq!(value, Some(serde_json::json!(41)));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn undecryptable_frames_are_dropped_not_fatal() {
        let key = crypto::generate_session_key();
        let other_key = crypto::generate_session_key();
        let (events, mut events_rx) = broadcast::channel(8);
        let mut pending: HashMap<String, oneshot::Sender<Result<Value, StorageError>>> =
            HashMap::new();

        let frame = crypto::seal(&other_key, b"{}").unwrap();
        handle_frame(&key, &frame, &events, &mut pending);
        assert!(matches!(
            events_rx.try_recv().unwrap(),
            StorageEvent::Error { .. }
        ));
    }
}
