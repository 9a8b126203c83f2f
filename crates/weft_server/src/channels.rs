//! Channel broker: broadcast groups over live connections.
//!
//! A channel exists for the lifetime of at least one connection holding it;
//! empty channels are removed. Fan-out writes into each member's bounded
//! outbox with `try_send`, so one slow consumer drops its own frames
//! instead of stalling the rest of the channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use weft_core::protocol::ServerPush;

/// Depth of each connection's broadcast outbox.
pub const OUTBOX_DEPTH: usize = 32;

/// Tracks which connections share each channel and fans events out to them.
#[derive(Default)]
pub struct ChannelBroker {
    channels: RwLock<HashMap<String, HashMap<u64, mpsc::Sender<ServerPush>>>>,
    next_id: AtomicU64,
}

impl ChannelBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a connection id.
    pub fn next_conn_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Add a connection's outbox to a channel, creating the channel on
    /// first join.
    pub async fn join(&self, channel_id: &str, conn_id: u64, outbox: mpsc::Sender<ServerPush>) {
        let mut channels = self.channels.write().await;
        let members = channels.entry(channel_id.to_string()).or_default();
        members.insert(conn_id, outbox);
        debug!(
            "connection {} joined {} ({} member(s))",
            conn_id,
            channel_id,
            members.len()
        );
    }

    /// Remove a connection from its channel, dropping the channel once
    /// empty.
    pub async fn leave(&self, channel_id: &str, conn_id: u64) {
        let mut channels = self.channels.write().await;
        if let Some(members) = channels.get_mut(channel_id) {
            members.remove(&conn_id);
            if members.is_empty() {
                channels.remove(channel_id);
                debug!("channel {} is empty, removed", channel_id);
            }
        }
    }

    /// Number of live connections in a channel.
    pub async fn member_count(&self, channel_id: &str) -> usize {
        self.channels
            .read()
            .await
            .get(channel_id)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    /// Deliver an event to every member of a channel except `except`.
    ///
    /// Send failures are logged and do not abort the fan-out.
    pub async fn broadcast(&self, channel_id: &str, event: ServerPush, except: u64) {
        let channels = self.channels.read().await;
        let Some(members) = channels.get(channel_id) else {
            return;
        };
        for (&conn_id, outbox) in members {
            if conn_id == except {
                continue;
            }
            match outbox.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "connection {} outbox full, dropping broadcast on {}",
                        conn_id, channel_id
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!(
                        "connection {} outbox closed, broadcast on {} skipped",
                        conn_id, channel_id
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::protocol::MutationKind;

    fn set_event(key: &str) -> ServerPush {
        ServerPush::Event {
            event: MutationKind::Set,
            collection: "test".to_string(),
            key: Some(key.to_string()),
            value: None,
        }
    }

    #[tokio::test]
    async fn broadcast_excludes_the_sender() {
        let broker = ChannelBroker::new();
        let (tx1, mut rx1) = mpsc::channel(OUTBOX_DEPTH);
        let (tx2, mut rx2) = mpsc::channel(OUTBOX_DEPTH);
        let (tx3, mut rx3) = mpsc::channel(OUTBOX_DEPTH);
        broker.join("channel_x", 1, tx1).await;
        broker.join("channel_x", 2, tx2).await;
        broker.join("channel_x", 3, tx3).await;

        broker.broadcast("channel_x", set_event("k"), 1).await;

        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_ok());
    }

    #[tokio::test]
    async fn broadcast_is_scoped_to_the_channel() {
        let broker = ChannelBroker::new();
        let (tx1, mut rx1) = mpsc::channel(OUTBOX_DEPTH);
        let (tx2, mut rx2) = mpsc::channel(OUTBOX_DEPTH);
        broker.join("channel_x", 1, tx1).await;
        broker.join("channel_y", 2, tx2).await;

        broker.broadcast("channel_x", set_event("k"), 99).await;

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn leave_drops_empty_channels() {
        let broker = ChannelBroker::new();
        let (tx, _rx) = mpsc::channel(OUTBOX_DEPTH);
        broker.join("channel_x", 1, tx).await;
        assert_eq!(broker.member_count("channel_x").await, 1);

        broker.leave("channel_x", 1).await;
        assert_eq!(broker.member_count("channel_x").await, 0);
        assert!(broker.channels.read().await.is_empty());
    }

    #[tokio::test]
    async fn a_full_outbox_does_not_stall_other_members() {
        let broker = ChannelBroker::new();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (ok_tx, mut ok_rx) = mpsc::channel(OUTBOX_DEPTH);
        broker.join("channel_x", 1, slow_tx).await;
        broker.join("channel_x", 2, ok_tx).await;

        // Two broadcasts overflow the slow member's depth-1 outbox; the
        // healthy member still sees both.
        broker.broadcast("channel_x", set_event("a"), 99).await;
        broker.broadcast("channel_x", set_event("b"), 99).await;

        assert!(ok_rx.try_recv().is_ok());
        assert!(ok_rx.try_recv().is_ok());
    }
}
