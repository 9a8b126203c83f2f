//! # `weft_gateway`
//!
//! The gateway-style connection core: this workspace's reference
//! implementation of the heartbeat / ack / resume / invalidate discipline,
//! in the shape of a Discord-flavored gateway client.
//!
//! The pieces:
//!
//! - [`connection`]: the opcode state machine, heartbeat loop, and
//!   bounded-backoff reconnect driver;
//! - [`session`]: pluggable persistence of `{session id, sequence, resume
//!   url}` so a restart resumes instead of re-identifying;
//! - [`rate_limit`]: per-opcode retry windows honored before every send;
//! - [`presence`]: validated construction of activity/presence payloads;
//! - [`protocol`]: the frame and opcode types.
//!
//! Transports come from `weft_core::transport`, so tests drive the state
//! machine with scripted connections instead of sockets.

#![warn(missing_docs)]

pub mod connection;
pub mod presence;
pub mod protocol;
pub mod rate_limit;
pub mod session;

pub use connection::{
    GatewayClient, GatewayConfig, GatewayEvent, GatewayHandle, ReconnectPolicy,
};
pub use presence::{Activity, ActivityKind, PresenceUpdate};
pub use protocol::{GatewayPayload, Opcode};
pub use session::{FileSessionStore, MemorySessionStore, SessionData, SessionStore};
