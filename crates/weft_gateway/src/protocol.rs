//! Gateway protocol frames.
//!
//! Every frame is a JSON object tagged with a numeric `op`; dispatches
//! (op 0) additionally carry an event name `t` and a sequence number `s`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Opcodes the connection core handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Server-originated event delivery.
    Dispatch,
    /// Keepalive, either direction.
    Heartbeat,
    /// Client handshake after HELLO when no session exists.
    Identify,
    /// Presence update.
    PresenceUpdate,
    /// Client handshake after HELLO when a session can be replayed.
    Resume,
    /// Server asks the client to drop and redial.
    Reconnect,
    /// The server no longer recognizes the session.
    InvalidSession,
    /// First server frame; carries the heartbeat interval.
    Hello,
    /// Acknowledges a heartbeat.
    HeartbeatAck,
}

impl Opcode {
    /// The wire value.
    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Dispatch => 0,
            Opcode::Heartbeat => 1,
            Opcode::Identify => 2,
            Opcode::PresenceUpdate => 3,
            Opcode::Resume => 6,
            Opcode::Reconnect => 7,
            Opcode::InvalidSession => 9,
            Opcode::Hello => 10,
            Opcode::HeartbeatAck => 11,
        }
    }

    /// Parse a wire value.
    pub fn from_u8(op: u8) -> Option<Self> {
        match op {
            0 => Some(Opcode::Dispatch),
            1 => Some(Opcode::Heartbeat),
            2 => Some(Opcode::Identify),
            3 => Some(Opcode::PresenceUpdate),
            6 => Some(Opcode::Resume),
            7 => Some(Opcode::Reconnect),
            9 => Some(Opcode::InvalidSession),
            10 => Some(Opcode::Hello),
            11 => Some(Opcode::HeartbeatAck),
            _ => None,
        }
    }
}

/// One gateway frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPayload {
    /// Opcode.
    pub op: u8,
    /// Opcode-specific data.
    #[serde(default)]
    pub d: Value,
    /// Sequence number, on dispatches only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    /// Event name, on dispatches only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayPayload {
    /// A client frame with no sequence or event name.
    pub fn new(op: Opcode, d: Value) -> Self {
        Self {
            op: op.as_u8(),
            d,
            s: None,
            t: None,
        }
    }

    /// A heartbeat carrying the last seen sequence (or null).
    pub fn heartbeat(sequence: Option<u64>) -> Self {
        Self::new(
            Opcode::Heartbeat,
            sequence.map(|s| json!(s)).unwrap_or(Value::Null),
        )
    }

    /// An IDENTIFY frame.
    pub fn identify(token: &str, properties: &ConnectionProperties) -> Self {
        Self::new(
            Opcode::Identify,
            json!({
                "token": token,
                "properties": properties,
            }),
        )
    }

    /// A RESUME frame replaying from the last acknowledged sequence.
    pub fn resume(token: &str, session_id: &str, sequence: u64) -> Self {
        Self::new(
            Opcode::Resume,
            json!({
                "token": token,
                "session_id": session_id,
                "seq": sequence,
            }),
        )
    }
}

/// Client platform identification sent with IDENTIFY.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionProperties {
    /// Operating system.
    pub os: String,
    /// Library or browser name.
    pub browser: String,
    /// Device name.
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "weft".to_string(),
            device: "weft".to_string(),
        }
    }
}

/// HELLO payload fields the core reads.
#[derive(Debug, Clone, Deserialize)]
pub struct HelloData {
    /// Heartbeat cadence in milliseconds.
    pub heartbeat_interval: u64,
    /// Optional override for the ack deadline (auth gateway variant).
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Dispatch event names the core reacts to itself.
pub const EVENT_READY: &str = "READY";
/// See [`EVENT_READY`].
pub const EVENT_RESUMED: &str = "RESUMED";
/// See [`EVENT_READY`].
pub const EVENT_RATE_LIMITED: &str = "RATE_LIMITED";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_round_trip() {
        for op in [
            Opcode::Dispatch,
            Opcode::Heartbeat,
            Opcode::Identify,
            Opcode::PresenceUpdate,
            Opcode::Resume,
            Opcode::Reconnect,
            Opcode::InvalidSession,
            Opcode::Hello,
            Opcode::HeartbeatAck,
        ] {
            assert_eq!(Opcode::from_u8(op.as_u8()), Some(op));
        }
        assert_eq!(Opcode::from_u8(42), None);
    }

    #[test]
    fn heartbeat_carries_null_before_first_dispatch() {
        assert_eq!(
            serde_json::to_value(GatewayPayload::heartbeat(None)).unwrap(),
            json!({"op": 1, "d": null})
        );
        assert_eq!(
            serde_json::to_value(GatewayPayload::heartbeat(Some(42))).unwrap(),
            json!({"op": 1, "d": 42})
        );
    }

    #[test]
    fn resume_frame_shape() {
        let frame = GatewayPayload::resume("tok", "sess", 7);
        assert_eq!(
            serde_json::to_value(frame).unwrap(),
            json!({"op": 6, "d": {"token": "tok", "session_id": "sess", "seq": 7}})
        );
    }

    #[test]
    fn hello_data_parses_with_and_without_timeout() {
        let d: HelloData =
            serde_json::from_value(json!({"heartbeat_interval": 41250})).unwrap();
        assert_eq!(d.heartbeat_interval, 41250);
        assert_eq!(d.timeout_ms, None);

        let d: HelloData =
            serde_json::from_value(json!({"heartbeat_interval": 1000, "timeout_ms": 500}))
                .unwrap();
        assert_eq!(d.timeout_ms, Some(500));
    }
}
