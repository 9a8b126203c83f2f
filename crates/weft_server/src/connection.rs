//! Per-connection state machine.
//!
//! Each WebSocket runs accept → hello → key-exchange → authenticated →
//! request loop → close:
//!
//! 1. The first frame must be a plaintext `hello` carrying the token; the
//!    configured validator decides whether the session may proceed.
//! 2. The server derives the channel id, generates a fresh session key and
//!    IV, seals the key under the token-derived secret, and sends the
//!    `hello` / `encryption` pair in the clear.
//! 3. The tenant's bucket is resolved (created on first sight) and the
//!    connection joins its channel.
//! 4. Every further frame in either direction is AEAD-sealed. Undecryptable
//!    frames are dropped, unparseable requests get an un-correlated error
//!    frame, and the connection keeps running either way.
//!
//! Teardown always removes the connection from the broker, whichever side
//! closed first.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use weft_core::crypto::{self, SESSION_KEY_LEN};
use weft_core::protocol::{ClientHello, Request, ServerHandshake, ServerPush};

use crate::channels::OUTBOX_DEPTH;
use crate::dispatch::{dispatch, DispatchContext};
use crate::AppState;

/// Upgrade handler for the `/ws` endpoint.
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

type WsSink = SplitSink<WebSocket, Message>;
type WsSource = SplitStream<WebSocket>;

async fn send_plain(tx: &mut WsSink, frame: &ServerHandshake) -> Result<(), axum::Error> {
    match serde_json::to_string(frame) {
        Ok(json) => tx.send(Message::Text(json.into())).await,
        Err(e) => {
            warn!("failed to serialize handshake frame: {}", e);
            Ok(())
        }
    }
}

async fn send_sealed(
    tx: &mut WsSink,
    key: &[u8; SESSION_KEY_LEN],
    plaintext: &str,
) -> Result<(), axum::Error> {
    match crypto::seal(key, plaintext.as_bytes()) {
        Ok(frame) => tx.send(Message::Text(frame.into())).await,
        Err(e) => {
            warn!("failed to seal outbound frame: {}", e);
            Ok(())
        }
    }
}

/// The next text frame, skipping control frames. `None` means the peer went
/// away.
async fn recv_text(rx: &mut WsSource, tx: &mut WsSink) -> Option<String> {
    loop {
        match rx.next().await? {
            Ok(Message::Text(text)) => return Some(text.to_string()),
            Ok(Message::Ping(data)) => {
                let _ = tx.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // ACCEPTED: the first frame must be a plaintext hello.
    let Some(first) = recv_text(&mut ws_rx, &mut ws_tx).await else {
        return;
    };
    let token = match serde_json::from_str::<ClientHello>(&first) {
        Ok(ClientHello::Hello { token }) => token,
        Err(_) => {
            debug!("closing connection: first frame was not a hello");
            let _ = send_plain(
                &mut ws_tx,
                &ServerHandshake::Error {
                    error: "Expected hello".to_string(),
                },
            )
            .await;
            return;
        }
    };

    if !state.validator.validate(&token).await {
        info!("rejected token");
        let _ = send_plain(
            &mut ws_tx,
            &ServerHandshake::Error {
                error: "Invalid token".to_string(),
            },
        )
        .await;
        return;
    }

    // KEY-EXCHANGED: derive the channel, mint and wrap the session cipher.
    let channel_id = crypto::derive_channel_id(&token);
    let secret = crypto::derive_token_secret(&token);
    let session_key = crypto::generate_session_key();
    let session_iv = crypto::generate_iv();
    let wrapped = match crypto::wrap_session_key(&secret, &session_key) {
        Ok(w) => w,
        Err(e) => {
            warn!("failed to wrap session key: {}", e);
            return;
        }
    };

    if send_plain(
        &mut ws_tx,
        &ServerHandshake::Hello {
            channel_id: channel_id.clone(),
        },
    )
    .await
    .is_err()
    {
        return;
    }
    if send_plain(
        &mut ws_tx,
        &ServerHandshake::Encryption {
            encryption_key: wrapped,
            iv: BASE64.encode(session_iv),
        },
    )
    .await
    .is_err()
    {
        return;
    }

    // AUTHENTICATED: attach the tenant bucket and join the channel.
    let storage = match state.buckets.ensure_user_bucket(&token).await {
        Ok(s) => s,
        Err(e) => {
            warn!("failed to resolve tenant bucket: {}", e);
            let _ = send_plain(
                &mut ws_tx,
                &ServerHandshake::Error {
                    error: "Storage unavailable".to_string(),
                },
            )
            .await;
            return;
        }
    };

    let conn_id = state.broker.next_conn_id();
    let (outbox_tx, mut outbox_rx) = mpsc::channel(OUTBOX_DEPTH);
    state.broker.join(&channel_id, conn_id, outbox_tx).await;
    info!("connection {} authenticated on {}", conn_id, channel_id);

    let ctx = DispatchContext {
        storage,
        buckets: state.buckets.clone(),
        broker: state.broker.clone(),
        channel_id: channel_id.clone(),
        conn_id,
    };

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(frame))) => {
                        if handle_request_frame(&mut ws_tx, &session_key, &ctx, &frame).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("connection {} transport error: {}", conn_id, e);
                        break;
                    }
                }
            }

            event = outbox_rx.recv() => {
                match event {
                    Some(push) => {
                        let json = match serde_json::to_string(&push) {
                            Ok(j) => j,
                            Err(e) => {
                                warn!("failed to serialize broadcast: {}", e);
                                continue;
                            }
                        };
                        if send_sealed(&mut ws_tx, &session_key, &json).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    state.broker.leave(&channel_id, conn_id).await;
    info!("connection {} left {}", conn_id, channel_id);
}

/// Decrypt, parse, dispatch, and answer one inbound frame.
///
/// Only a transport failure is an error; bad frames keep the connection
/// alive.
async fn handle_request_frame(
    ws_tx: &mut WsSink,
    session_key: &[u8; SESSION_KEY_LEN],
    ctx: &DispatchContext,
    frame: &str,
) -> Result<(), ()> {
    let plaintext = match crypto::open(session_key, frame) {
        Ok(p) => p,
        Err(e) => {
            // Not valid ciphertext under this session: drop it.
            warn!("connection {}: dropping undecryptable frame: {}", ctx.conn_id, e);
            return Ok(());
        }
    };

    let request = match serde_json::from_slice::<Request>(&plaintext) {
        Ok(r) => r,
        Err(e) => {
            debug!("connection {}: malformed request: {}", ctx.conn_id, e);
            let error = ServerPush::Error {
                error: format!("Invalid request: {}", e),
            };
            let Ok(json) = serde_json::to_string(&error) else {
                return Ok(());
            };
            return send_sealed(ws_tx, session_key, &json)
                .await
                .map_err(|_| ());
        }
    };

    let response = dispatch(ctx, request).await;
    let Ok(json) = serde_json::to_string(&response) else {
        warn!("connection {}: failed to serialize response", ctx.conn_id);
        return Ok(());
    };
    send_sealed(ws_tx, session_key, &json).await.map_err(|_| ())
}
