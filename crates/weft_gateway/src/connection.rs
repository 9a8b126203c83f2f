//! The gateway connection core.
//!
//! A [`GatewayClient`] drives one logical connection through the opcode
//! state machine: wait for HELLO, IDENTIFY or RESUME, heartbeat on the
//! server's cadence, and react to dispatches, reconnect requests, and
//! session invalidation. A missed heartbeat ack is a fatal transport
//! failure: the client emits exactly one `Disconnected`, closes the socket,
//! and re-enters the connect loop under exponential backoff.
//!
//! The client owns the transport; callers interact through a
//! [`GatewayHandle`] (commands in, [`GatewayEvent`]s out).

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Duration, Instant};

use weft_core::transport::{MessageTransport, TransportConnector, WsMessage};

use crate::presence::PresenceUpdate;
use crate::protocol::{
    ConnectionProperties, GatewayPayload, HelloData, Opcode, EVENT_RATE_LIMITED, EVENT_READY,
    EVENT_RESUMED,
};
use crate::rate_limit::RateLimitTracker;
use crate::session::{SessionData, SessionStore};

/// How long to wait for the server's HELLO after connecting.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause before answering an invalid-session frame.
const INVALID_SESSION_DELAY: Duration = Duration::from_millis(150);

/// Close code signalling a reconnect-and-resume is acceptable.
const CLOSE_CODE_RECONNECT: u16 = 4000;

/// Capacity of the event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// First delay unit.
    pub base: Duration,
    /// Multiplier per attempt.
    pub factor: u32,
    /// Upper bound on any delay.
    pub cap: Duration,
    /// Attempts before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            factor: 2,
            cap: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        (self.base * self.factor.saturating_pow(attempt)).min(self.cap)
    }
}

/// Gateway client configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// URL to dial when no resumable session exists.
    pub gateway_url: String,
    /// Authentication token.
    pub token: String,
    /// Platform identification for IDENTIFY.
    pub properties: ConnectionProperties,
    /// Reconnect backoff policy.
    pub reconnect: ReconnectPolicy,
}

impl GatewayConfig {
    /// Config with the default backoff and properties.
    pub fn new(gateway_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            gateway_url: gateway_url.into(),
            token: token.into(),
            properties: ConnectionProperties::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Events the client emits.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// IDENTIFY succeeded; the session is live.
    Ready {
        /// Server-assigned session id.
        session_id: String,
        /// Authenticated user, if the server named one.
        user_id: Option<String>,
    },
    /// RESUME succeeded; the session is live again.
    Resumed,
    /// A dispatch the core does not handle itself.
    Dispatch {
        /// Event name (`t`).
        event: String,
        /// Event payload (`d`).
        data: Value,
    },
    /// The server acknowledged a heartbeat.
    HeartbeatAck {
        /// Round-trip latency in milliseconds.
        latency_ms: u64,
    },
    /// The connection dropped. Emitted exactly once per drop.
    Disconnected {
        /// Why.
        reason: String,
    },
    /// A reconnect attempt is scheduled.
    Reconnecting {
        /// Attempt number, 1-based.
        attempt: u32,
        /// Backoff delay in milliseconds.
        delay_ms: u64,
    },
    /// A non-recoverable error, or a transient one worth surfacing.
    Error {
        /// Single-line message.
        message: String,
    },
}

enum GatewayCommand {
    Send(GatewayPayload),
    UpdatePresence(Box<PresenceUpdate>),
    Close,
}

/// The client task is gone; the command was not delivered.
#[derive(Debug)]
pub struct GatewayClosed;

impl std::fmt::Display for GatewayClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gateway client is closed")
    }
}

impl std::error::Error for GatewayClosed {}

/// Caller-side handle to a running [`GatewayClient`].
#[derive(Clone)]
pub struct GatewayHandle {
    cmd_tx: mpsc::Sender<GatewayCommand>,
    events: broadcast::Sender<GatewayEvent>,
}

impl GatewayHandle {
    /// Subscribe to the client's events.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    /// Send a raw payload (rate-limit windows apply).
    pub async fn send(&self, payload: GatewayPayload) -> Result<(), GatewayClosed> {
        self.cmd_tx
            .send(GatewayCommand::Send(payload))
            .await
            .map_err(|_| GatewayClosed)
    }

    /// Send a presence update.
    pub async fn update_presence(&self, presence: PresenceUpdate) -> Result<(), GatewayClosed> {
        self.cmd_tx
            .send(GatewayCommand::UpdatePresence(Box::new(presence)))
            .await
            .map_err(|_| GatewayClosed)
    }

    /// Shut the client down.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(GatewayCommand::Close).await;
    }
}

/// One gateway connection and its reconnect loop.
pub struct GatewayClient<C: TransportConnector> {
    config: GatewayConfig,
    connector: C,
    store: Arc<dyn SessionStore>,
    rate: RateLimitTracker,
    events: broadcast::Sender<GatewayEvent>,
    cmd_rx: mpsc::Receiver<GatewayCommand>,
}

impl<C: TransportConnector> GatewayClient<C> {
    /// Build a client and its handle.
    pub fn new(
        config: GatewayConfig,
        connector: C,
        store: Arc<dyn SessionStore>,
    ) -> (Self, GatewayHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let handle = GatewayHandle {
            cmd_tx,
            events: events.clone(),
        };
        (
            Self {
                config,
                connector,
                store,
                rate: RateLimitTracker::new(),
                events,
                cmd_rx,
            },
            handle,
        )
    }

    /// Drive the connection until it is closed or reconnects are exhausted.
    pub async fn run(mut self) {
        let mut attempt = 0u32;
        loop {
            if attempt > 0 {
                if attempt > self.config.reconnect.max_attempts {
                    emit(
                        &self.events,
                        GatewayEvent::Error {
                            message: "max reconnect attempts reached".to_string(),
                        },
                    );
                    break;
                }
                let delay = self.config.reconnect.delay(attempt);
                emit(
                    &self.events,
                    GatewayEvent::Reconnecting {
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                    },
                );
                log::info!(
                    "[Gateway] reconnecting in {:?} (attempt {}/{})",
                    delay,
                    attempt,
                    self.config.reconnect.max_attempts
                );
                time::sleep(delay).await;
            }

            let stored = self.store.load();
            let url = stored
                .as_ref()
                .map(|s| s.resume_gateway_url.clone())
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| self.config.gateway_url.clone());

            let mut transport = match self.connector.connect(&url).await {
                Ok(t) => t,
                Err(e) => {
                    log::warn!("[Gateway] connection to {} failed: {}", url, e);
                    emit(
                        &self.events,
                        GatewayEvent::Error {
                            message: format!("connection failed: {}", e),
                        },
                    );
                    attempt += 1;
                    continue;
                }
            };

            let end = run_session(
                &self.config,
                self.store.as_ref(),
                &self.rate,
                &self.events,
                &mut self.cmd_rx,
                &mut transport,
                stored,
                &mut attempt,
            )
            .await;

            match end {
                SessionEnd::Closed => {
                    let _ = transport.close().await;
                    break;
                }
                SessionEnd::Reconnect => {
                    attempt += 1;
                }
                SessionEnd::Terminal(reason) => {
                    emit(&self.events, GatewayEvent::Error { message: reason });
                    break;
                }
            }
        }
        log::info!("[Gateway] client loop exited");
    }
}

enum SessionEnd {
    Closed,
    Reconnect,
    Terminal(String),
}

enum Flow {
    Continue,
    End(SessionEnd),
}

#[derive(Debug, Default)]
struct LiveSession {
    session_id: Option<String>,
    resume_url: Option<String>,
    user_id: Option<String>,
    sequence: Option<u64>,
}

/// Cancel-safe ack deadline: pends forever while disarmed.
#[derive(Debug, Default)]
struct AckTimer {
    deadline: Option<Instant>,
}

impl AckTimer {
    fn arm(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    fn disarm(&mut self) {
        self.deadline = None;
    }

    async fn timeout(&mut self) {
        match self.deadline {
            Some(deadline) => {
                time::sleep_until(deadline).await;
                self.deadline = None;
            }
            None => std::future::pending().await,
        }
    }
}

fn emit(events: &broadcast::Sender<GatewayEvent>, event: GatewayEvent) {
    let _ = events.send(event);
}

fn persist(store: &dyn SessionStore, config: &GatewayConfig, live: &LiveSession) {
    let (Some(session_id), Some(resume_url)) = (&live.session_id, &live.resume_url) else {
        return;
    };
    store.save(&SessionData {
        token: config.token.clone(),
        session_id: session_id.clone(),
        sequence: live.sequence.unwrap_or(0),
        resume_gateway_url: resume_url.clone(),
        timestamp: chrono::Utc::now().timestamp_millis(),
        user_id: live.user_id.clone(),
    });
}

async fn send_payload<T: MessageTransport>(
    transport: &mut T,
    rate: &RateLimitTracker,
    payload: &GatewayPayload,
) -> Result<(), ()> {
    rate.wait_for_availability(payload.op).await;
    let json = match serde_json::to_string(payload) {
        Ok(j) => j,
        Err(e) => {
            log::warn!("[Gateway] failed to serialize payload: {}", e);
            return Ok(());
        }
    };
    transport.send_text(json).await.map_err(|e| {
        log::warn!("[Gateway] send failed: {}", e);
    })
}

async fn wait_for_hello<T: MessageTransport>(transport: &mut T) -> Result<HelloData, SessionEnd> {
    loop {
        match transport.recv().await {
            Some(Ok(WsMessage::Text(text))) => {
                if let Ok(payload) = serde_json::from_str::<GatewayPayload>(&text) {
                    if payload.op == Opcode::Hello.as_u8() {
                        return serde_json::from_value::<HelloData>(payload.d).map_err(|e| {
                            SessionEnd::Terminal(format!("malformed hello: {}", e))
                        });
                    }
                    log::debug!("[Gateway] ignoring op {} before hello", payload.op);
                }
            }
            Some(Ok(WsMessage::Close(code))) => {
                return Err(match code {
                    Some(CLOSE_CODE_RECONNECT) | None => SessionEnd::Reconnect,
                    Some(code) => SessionEnd::Terminal(format!("closed with code {}", code)),
                });
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                log::warn!("[Gateway] transport error before hello: {}", e);
                return Err(SessionEnd::Reconnect);
            }
            None => return Err(SessionEnd::Reconnect),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_session<T: MessageTransport>(
    config: &GatewayConfig,
    store: &dyn SessionStore,
    rate: &RateLimitTracker,
    events: &broadcast::Sender<GatewayEvent>,
    cmd_rx: &mut mpsc::Receiver<GatewayCommand>,
    transport: &mut T,
    stored: Option<SessionData>,
    attempt: &mut u32,
) -> SessionEnd {
    let hello = match time::timeout(HELLO_TIMEOUT, wait_for_hello(transport)).await {
        Ok(Ok(hello)) => hello,
        Ok(Err(end)) => {
            emit(
                events,
                GatewayEvent::Disconnected {
                    reason: "connection lost before hello".to_string(),
                },
            );
            return end;
        }
        Err(_) => {
            emit(
                events,
                GatewayEvent::Disconnected {
                    reason: "timed out waiting for hello".to_string(),
                },
            );
            return SessionEnd::Reconnect;
        }
    };

    let mut heartbeat = Duration::from_millis(hello.heartbeat_interval.max(1));
    let mut ack_timeout = hello
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(heartbeat);
    let mut interval = time::interval_at(Instant::now() + heartbeat, heartbeat);
    let mut ack = AckTimer::default();
    let mut heartbeat_sent_at: Option<Instant> = None;

    let mut live = LiveSession {
        session_id: stored.as_ref().map(|s| s.session_id.clone()),
        resume_url: stored.as_ref().map(|s| s.resume_gateway_url.clone()),
        user_id: stored.as_ref().and_then(|s| s.user_id.clone()),
        sequence: stored.as_ref().map(|s| s.sequence),
    };

    // IDENTIFY from zero, or RESUME from the stored session.
    let opening = match (&live.session_id, live.sequence) {
        (Some(session_id), Some(sequence)) => {
            log::info!("[Gateway] resuming session {} from seq {}", session_id, sequence);
            GatewayPayload::resume(&config.token, session_id, sequence)
        }
        _ => {
            log::info!("[Gateway] identifying");
            GatewayPayload::identify(&config.token, &config.properties)
        }
    };
    if send_payload(transport, rate, &opening).await.is_err() {
        emit(
            events,
            GatewayEvent::Disconnected {
                reason: "handshake send failed".to_string(),
            },
        );
        return SessionEnd::Reconnect;
    }

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let beat = GatewayPayload::heartbeat(live.sequence);
                if send_payload(transport, rate, &beat).await.is_err() {
                    emit(events, GatewayEvent::Disconnected {
                        reason: "heartbeat send failed".to_string(),
                    });
                    return SessionEnd::Reconnect;
                }
                heartbeat_sent_at = Some(Instant::now());
                ack.arm(Instant::now() + ack_timeout);
            }

            _ = ack.timeout() => {
                log::warn!("[Gateway] no heartbeat ack within {:?}", ack_timeout);
                emit(events, GatewayEvent::Error {
                    message: "heartbeat ack timeout".to_string(),
                });
                emit(events, GatewayEvent::Disconnected {
                    reason: "heartbeat ack timeout".to_string(),
                });
                let _ = transport.close().await;
                return SessionEnd::Reconnect;
            }

            cmd = cmd_rx.recv() => match cmd {
                None | Some(GatewayCommand::Close) => return SessionEnd::Closed,
                Some(GatewayCommand::Send(payload)) => {
                    if send_payload(transport, rate, &payload).await.is_err() {
                        emit(events, GatewayEvent::Disconnected {
                            reason: "send failed".to_string(),
                        });
                        return SessionEnd::Reconnect;
                    }
                }
                Some(GatewayCommand::UpdatePresence(presence)) => {
                    let payload = GatewayPayload::new(
                        Opcode::PresenceUpdate,
                        serde_json::to_value(presence.as_ref()).unwrap_or(Value::Null),
                    );
                    if send_payload(transport, rate, &payload).await.is_err() {
                        emit(events, GatewayEvent::Disconnected {
                            reason: "send failed".to_string(),
                        });
                        return SessionEnd::Reconnect;
                    }
                }
            },

            msg = transport.recv() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    let payload = match serde_json::from_str::<GatewayPayload>(&text) {
                        Ok(p) => p,
                        Err(e) => {
                            log::debug!("[Gateway] unparseable frame: {}", e);
                            continue;
                        }
                    };
                    match handle_payload(
                        payload,
                        config,
                        store,
                        rate,
                        events,
                        transport,
                        &mut interval,
                        &mut heartbeat,
                        &mut ack_timeout,
                        &mut ack,
                        &mut heartbeat_sent_at,
                        &mut live,
                        attempt,
                    )
                    .await
                    {
                        Flow::Continue => {}
                        Flow::End(end) => return end,
                    }
                }
                Some(Ok(WsMessage::Close(code))) => {
                    emit(events, GatewayEvent::Disconnected {
                        reason: format!("closed by peer ({:?})", code),
                    });
                    return match code {
                        Some(CLOSE_CODE_RECONNECT) | None => SessionEnd::Reconnect,
                        Some(code) => SessionEnd::Terminal(format!("closed with code {}", code)),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    emit(events, GatewayEvent::Disconnected {
                        reason: format!("transport error: {}", e),
                    });
                    return SessionEnd::Reconnect;
                }
                None => {
                    emit(events, GatewayEvent::Disconnected {
                        reason: "stream ended".to_string(),
                    });
                    return SessionEnd::Reconnect;
                }
            },
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_payload<T: MessageTransport>(
    payload: GatewayPayload,
    config: &GatewayConfig,
    store: &dyn SessionStore,
    rate: &RateLimitTracker,
    events: &broadcast::Sender<GatewayEvent>,
    transport: &mut T,
    interval: &mut time::Interval,
    heartbeat: &mut Duration,
    ack_timeout: &mut Duration,
    ack: &mut AckTimer,
    heartbeat_sent_at: &mut Option<Instant>,
    live: &mut LiveSession,
    attempt: &mut u32,
) -> Flow {
    let Some(op) = Opcode::from_u8(payload.op) else {
        log::debug!("[Gateway] unknown opcode {}", payload.op);
        return Flow::Continue;
    };

    match op {
        Opcode::Dispatch => {
            if let Some(sequence) = payload.s {
                live.sequence = Some(sequence);
                persist(store, config, live);
            }
            match payload.t.as_deref() {
                Some(EVENT_READY) => {
                    live.session_id = payload
                        .d
                        .get("session_id")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    live.resume_url = payload
                        .d
                        .get("resume_gateway_url")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    live.user_id = payload
                        .d
                        .get("user")
                        .and_then(|u| u.get("id"))
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    *attempt = 0;
                    persist(store, config, live);
                    emit(
                        events,
                        GatewayEvent::Ready {
                            session_id: live.session_id.clone().unwrap_or_default(),
                            user_id: live.user_id.clone(),
                        },
                    );
                }
                Some(EVENT_RESUMED) => {
                    *attempt = 0;
                    persist(store, config, live);
                    emit(events, GatewayEvent::Resumed);
                }
                Some(EVENT_RATE_LIMITED) => {
                    let opcode = payload
                        .d
                        .get("opcode")
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as u8;
                    let retry_after = payload
                        .d
                        .get("retry_after")
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0)
                        .max(0.0);
                    log::debug!(
                        "[Gateway] opcode {} rate limited for {}s",
                        opcode,
                        retry_after
                    );
                    rate.record(opcode, Duration::from_secs_f64(retry_after));
                }
                Some(event) => {
                    emit(
                        events,
                        GatewayEvent::Dispatch {
                            event: event.to_string(),
                            data: payload.d,
                        },
                    );
                }
                None => {}
            }
            Flow::Continue
        }

        Opcode::Heartbeat => {
            // The server asked for an immediate beat.
            let beat = GatewayPayload::heartbeat(live.sequence);
            if send_payload(transport, rate, &beat).await.is_err() {
                emit(
                    events,
                    GatewayEvent::Disconnected {
                        reason: "heartbeat send failed".to_string(),
                    },
                );
                return Flow::End(SessionEnd::Reconnect);
            }
            *heartbeat_sent_at = Some(Instant::now());
            ack.arm(Instant::now() + *ack_timeout);
            Flow::Continue
        }

        Opcode::Reconnect => {
            emit(
                events,
                GatewayEvent::Disconnected {
                    reason: "server requested reconnect".to_string(),
                },
            );
            let _ = transport
                .close_with(CLOSE_CODE_RECONNECT, "reconnect requested")
                .await;
            Flow::End(SessionEnd::Reconnect)
        }

        Opcode::InvalidSession => {
            let can_resume = payload.d.as_bool().unwrap_or(false);
            log::info!("[Gateway] session invalidated (resumable: {})", can_resume);
            time::sleep(INVALID_SESSION_DELAY).await;
            let frame = match (&live.session_id, can_resume) {
                (Some(session_id), true) => {
                    GatewayPayload::resume(&config.token, session_id, live.sequence.unwrap_or(0))
                }
                _ => {
                    store.clear();
                    *live = LiveSession::default();
                    GatewayPayload::identify(&config.token, &config.properties)
                }
            };
            if send_payload(transport, rate, &frame).await.is_err() {
                emit(
                    events,
                    GatewayEvent::Disconnected {
                        reason: "handshake send failed".to_string(),
                    },
                );
                return Flow::End(SessionEnd::Reconnect);
            }
            Flow::Continue
        }

        Opcode::Hello => {
            // A HELLO in any state restarts the heartbeat clock.
            if let Ok(hello) = serde_json::from_value::<HelloData>(payload.d) {
                *heartbeat = Duration::from_millis(hello.heartbeat_interval.max(1));
                *ack_timeout = hello
                    .timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(*heartbeat);
                *interval = time::interval_at(Instant::now() + *heartbeat, *heartbeat);
            }
            ack.disarm();
            Flow::Continue
        }

        Opcode::HeartbeatAck => {
            ack.disarm();
            if let Some(sent) = heartbeat_sent_at.take() {
                emit(
                    events,
                    GatewayEvent::HeartbeatAck {
                        latency_ms: sent.elapsed().as_millis() as u64,
                    },
                );
            }
            Flow::Continue
        }

        // Client-to-server opcodes; a server echoing them is ignored.
        Opcode::Identify | Opcode::PresenceUpdate | Opcode::Resume => Flow::Continue,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemorySessionStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use weft_core::transport::TransportError;

    struct ScriptedTransport {
        incoming: mpsc::UnboundedReceiver<WsMessage>,
        outgoing: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl MessageTransport for ScriptedTransport {
        async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
            self.outgoing
                .send(text)
                .map_err(|_| TransportError::SendFailed("script closed".into()))
        }

        async fn recv(&mut self) -> Option<Result<WsMessage, TransportError>> {
            self.incoming.recv().await.map(Ok)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close_with(&mut self, _code: u16, _reason: &str) -> Result<(), TransportError> {
            Ok(())
        }
    }

    /// Test side of one scripted connection.
    struct Peer {
        to_client: mpsc::UnboundedSender<WsMessage>,
        from_client: mpsc::UnboundedReceiver<String>,
    }

    impl Peer {
        fn send(&self, payload: serde_json::Value) {
            let _ = self.to_client.send(WsMessage::Text(payload.to_string()));
        }

        async fn next_payload(&mut self) -> GatewayPayload {
            let text = self.from_client.recv().await.expect("client sent a frame");
            serde_json::from_str(&text).expect("client frames are payloads")
        }
    }

    struct ScriptedConnector {
        transports: Mutex<VecDeque<ScriptedTransport>>,
        dialed: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl TransportConnector for ScriptedConnector {
        type Transport = ScriptedTransport;

        async fn connect(&self, url: &str) -> Result<Self::Transport, TransportError> {
            self.dialed.lock().unwrap().push(url.to_string());
            self.transports
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| TransportError::ConnectionFailed("script exhausted".into()))
        }
    }

    fn scripted(count: usize) -> (ScriptedConnector, Vec<Peer>, Arc<Mutex<Vec<String>>>) {
        let mut transports = VecDeque::new();
        let mut peers = Vec::new();
        for _ in 0..count {
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            transports.push_back(ScriptedTransport {
                incoming: in_rx,
                outgoing: out_tx,
            });
            peers.push(Peer {
                to_client: in_tx,
                from_client: out_rx,
            });
        }
        let dialed = Arc::new(Mutex::new(Vec::new()));
        (
            ScriptedConnector {
                transports: Mutex::new(transports),
                dialed: dialed.clone(),
            },
            peers,
            dialed,
        )
    }

    fn hello(interval_ms: u64) -> serde_json::Value {
        json!({"op": 10, "d": {"heartbeat_interval": interval_ms}})
    }

    async fn next_event(rx: &mut broadcast::Receiver<GatewayEvent>) -> GatewayEvent {
        rx.recv().await.expect("event stream open")
    }

    #[test]
    fn backoff_schedule_matches_the_policy() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=5).map(|a| policy.delay(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![400, 800, 1600, 3200, 5000]);
    }

    #[tokio::test(start_paused = true)]
    async fn identifies_then_becomes_ready() {
        let (connector, mut peers, _) = scripted(1);
        let store = Arc::new(MemorySessionStore::new());
        let (client, handle) = GatewayClient::new(
            GatewayConfig::new("wss://gateway.example", "tok"),
            connector,
            store.clone(),
        );
        let mut events = handle.subscribe();
        let task = tokio::spawn(client.run());
        let mut peer = peers.remove(0);

        peer.send(hello(60_000));
        let identify = peer.next_payload().await;
        assert_eq!(identify.op, Opcode::Identify.as_u8());
        assert_eq!(identify.d["token"], json!("tok"));

        peer.send(json!({
            "op": 0, "s": 1, "t": "READY",
            "d": {
                "session_id": "sess-1",
                "resume_gateway_url": "wss://resume.example",
                "user": {"id": "user-9"},
            },
        }));
        match next_event(&mut events).await {
            GatewayEvent::Ready {
                session_id,
                user_id,
            } => {
                assert_eq!(session_id, "sess-1");
                assert_eq!(user_id.as_deref(), Some("user-9"));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let saved = store.load().expect("session persisted on ready");
        assert_eq!(saved.session_id, "sess-1");
        assert_eq!(saved.sequence, 1);
        assert_eq!(saved.resume_gateway_url, "wss://resume.example");

        handle.close().await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_carry_the_sequence_and_acks_report_latency() {
        let (connector, mut peers, _) = scripted(1);
        let (client, handle) = GatewayClient::new(
            GatewayConfig::new("wss://gateway.example", "tok"),
            connector,
            Arc::new(MemorySessionStore::new()),
        );
        let mut events = handle.subscribe();
        let task = tokio::spawn(client.run());
        let mut peer = peers.remove(0);

        peer.send(hello(100));
        let identify = peer.next_payload().await;
        assert_eq!(identify.op, Opcode::Identify.as_u8());

        // No dispatch yet: the first beat carries null.
        let beat = peer.next_payload().await;
        assert_eq!(beat.op, Opcode::Heartbeat.as_u8());
        assert_eq!(beat.d, Value::Null);
        peer.send(json!({"op": 11}));
        assert!(matches!(
            next_event(&mut events).await,
            GatewayEvent::HeartbeatAck { .. }
        ));

        // After a dispatch, beats carry its sequence.
        peer.send(json!({"op": 0, "s": 7, "t": "OTHER", "d": {}}));
        assert!(matches!(
            next_event(&mut events).await,
            GatewayEvent::Dispatch { ref event, .. } if event == "OTHER"
        ));
        let beat = peer.next_payload().await;
        assert_eq!(beat.d, json!(7));
        peer.send(json!({"op": 11}));

        handle.close().await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn server_heartbeat_request_is_answered_immediately() {
        let (connector, mut peers, _) = scripted(1);
        let (client, handle) = GatewayClient::new(
            GatewayConfig::new("wss://gateway.example", "tok"),
            connector,
            Arc::new(MemorySessionStore::new()),
        );
        let task = tokio::spawn(client.run());
        let mut peer = peers.remove(0);

        // Long interval: any beat we see is the requested one.
        peer.send(hello(60_000));
        let _identify = peer.next_payload().await;

        peer.send(json!({"op": 1}));
        let beat = peer.next_payload().await;
        assert_eq!(beat.op, Opcode::Heartbeat.as_u8());

        handle.close().await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn missed_ack_disconnects_once_and_schedules_backoff() {
        let (connector, mut peers, dialed) = scripted(2);
        let (client, handle) = GatewayClient::new(
            GatewayConfig::new("wss://gateway.example", "tok"),
            connector,
            Arc::new(MemorySessionStore::new()),
        );
        let mut events = handle.subscribe();
        let task = tokio::spawn(client.run());

        let mut peer = peers.remove(0);
        // Ack deadline strictly inside the interval so the timeout fires
        // before the next scheduled beat.
        peer.send(json!({"op": 10, "d": {"heartbeat_interval": 100, "timeout_ms": 90}}));
        let _identify = peer.next_payload().await;
        let beat = peer.next_payload().await;
        assert_eq!(beat.op, Opcode::Heartbeat.as_u8());
        // Never ack: one timeout window later the connection is torn down.

        assert!(matches!(
            next_event(&mut events).await,
            GatewayEvent::Error { ref message } if message == "heartbeat ack timeout"
        ));
        match next_event(&mut events).await {
            GatewayEvent::Disconnected { reason } => {
                assert_eq!(reason, "heartbeat ack timeout");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match next_event(&mut events).await {
            GatewayEvent::Reconnecting { attempt, delay_ms } => {
                assert_eq!(attempt, 1);
                assert_eq!(delay_ms, 400);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // The second connection comes up; close it down.
        let mut peer2 = peers.remove(0);
        peer2.send(hello(60_000));
        let _identify = peer2.next_payload().await;
        assert_eq!(dialed.lock().unwrap().len(), 2);

        handle.close().await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnects_end_with_an_error() {
        // Every connect fails: the script holds no transports at all.
        let (connector, _peers, dialed) = scripted(0);
        let (client, handle) = GatewayClient::new(
            GatewayConfig::new("wss://gateway.example", "tok"),
            connector,
            Arc::new(MemorySessionStore::new()),
        );
        let mut events = handle.subscribe();
        let task = tokio::spawn(client.run());

        let mut delays = Vec::new();
        loop {
            match next_event(&mut events).await {
                GatewayEvent::Reconnecting { delay_ms, .. } => delays.push(delay_ms),
                GatewayEvent::Error { message } if message == "max reconnect attempts reached" => {
                    break;
                }
                GatewayEvent::Error { .. } => {}
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(delays, vec![400, 800, 1600, 3200, 5000]);
        // Initial dial plus five retries.
        assert_eq!(dialed.lock().unwrap().len(), 6);
        task.await.unwrap();
        drop(handle);
    }

    #[tokio::test(start_paused = true)]
    async fn resumes_from_a_stored_session() {
        let (connector, mut peers, dialed) = scripted(1);
        let store = Arc::new(MemorySessionStore::new());
        store.save(&SessionData {
            token: "tok".into(),
            session_id: "sess-1".into(),
            sequence: 9,
            resume_gateway_url: "wss://resume.example".into(),
            timestamp: 0,
            user_id: None,
        });
        let (client, handle) = GatewayClient::new(
            GatewayConfig::new("wss://gateway.example", "tok"),
            connector,
            store.clone(),
        );
        let mut events = handle.subscribe();
        let task = tokio::spawn(client.run());
        let mut peer = peers.remove(0);

        peer.send(hello(60_000));
        let resume = peer.next_payload().await;
        assert_eq!(resume.op, Opcode::Resume.as_u8());
        assert_eq!(resume.d["session_id"], json!("sess-1"));
        assert_eq!(resume.d["seq"], json!(9));
        assert_eq!(dialed.lock().unwrap()[0], "wss://resume.example");

        peer.send(json!({"op": 0, "t": "RESUMED", "d": {}}));
        assert!(matches!(next_event(&mut events).await, GatewayEvent::Resumed));

        handle.close().await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_session_wipes_state_and_identifies() {
        let (connector, mut peers, _) = scripted(1);
        let store = Arc::new(MemorySessionStore::new());
        store.save(&SessionData {
            token: "tok".into(),
            session_id: "sess-1".into(),
            sequence: 3,
            resume_gateway_url: "wss://resume.example".into(),
            timestamp: 0,
            user_id: None,
        });
        let (client, handle) = GatewayClient::new(
            GatewayConfig::new("wss://gateway.example", "tok"),
            connector,
            store.clone(),
        );
        let task = tokio::spawn(client.run());
        let mut peer = peers.remove(0);

        peer.send(hello(60_000));
        let resume = peer.next_payload().await;
        assert_eq!(resume.op, Opcode::Resume.as_u8());

        // The session cannot be resumed: expect a wipe and an IDENTIFY.
        peer.send(json!({"op": 9, "d": false}));
        let identify = peer.next_payload().await;
        assert_eq!(identify.op, Opcode::Identify.as_u8());
        assert!(store.load().is_none());

        handle.close().await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_dispatch_delays_that_opcode() {
        let (connector, mut peers, _) = scripted(1);
        let (client, handle) = GatewayClient::new(
            GatewayConfig::new("wss://gateway.example", "tok"),
            connector,
            Arc::new(MemorySessionStore::new()),
        );
        let task = tokio::spawn(client.run());
        let mut peer = peers.remove(0);

        peer.send(hello(60_000));
        let _identify = peer.next_payload().await;

        let mut events = handle.subscribe();
        peer.send(json!({
            "op": 0, "t": "RATE_LIMITED",
            "d": {"opcode": 3, "retry_after": 1.0},
        }));
        // Frames are processed in order: once the marker dispatch is
        // observed, the rate-limit window has been recorded.
        peer.send(json!({"op": 0, "t": "MARKER", "d": {}}));
        loop {
            if let GatewayEvent::Dispatch { event, .. } = next_event(&mut events).await {
                if event == "MARKER" {
                    break;
                }
            }
        }

        let presence = PresenceUpdate::online(vec![]);
        let sent_at = Instant::now();
        handle.update_presence(presence).await.unwrap();
        let payload = peer.next_payload().await;
        assert_eq!(payload.op, Opcode::PresenceUpdate.as_u8());
        assert!(sent_at.elapsed() >= Duration::from_secs(1));

        handle.close().await;
        task.await.unwrap();
    }
}
