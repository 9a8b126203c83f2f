//! # `weft_core`
//!
//! Shared code for the Weft storage fabric.
//!
//! Weft is a multi-tenant realtime key-value store: clients holding the same
//! token see one namespaced view of the data and receive every other holder's
//! mutations as live events, over an encrypted WebSocket transport.
//!
//! This crate carries everything both sides of the wire need:
//!
//! - the [`storage`] adapter contract implemented by every backend (the
//!   server's namespaced Redis adapter and the remote [`client`] adapter),
//! - the [`protocol`] frame types,
//! - the [`crypto`] handshake and per-frame sealing,
//! - the [`schema`] validation applied on write and read,
//! - the [`transport`] abstraction that lets tests substitute a scripted
//!   connection for a real WebSocket.

#![warn(missing_docs)]

pub mod client;
pub mod crypto;
pub mod protocol;
pub mod schema;
pub mod storage;
pub mod transport;

pub use client::{RemoteStorage, RemoteStorageConfig};
pub use storage::{StorageAdapter, StorageError, StorageEvent};
