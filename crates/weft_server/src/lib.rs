//! The Weft storage-fabric server.
//!
//! One axum application: a WebSocket upgrade endpoint at `/ws` where clients
//! run the token handshake and their encrypted request loop, and a static
//! fallback for everything else. Tenant data lives on a Redis-style backing
//! store behind the [`buckets::BucketManager`]; live connections sharing a
//! token form a channel in the [`channels::ChannelBroker`] and see each
//! other's mutations as event frames.

pub mod auth;
pub mod buckets;
pub mod channels;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod store;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use auth::TokenValidator;
use buckets::BucketManager;
use channels::ChannelBroker;

/// Shared state behind every connection.
#[derive(Clone)]
pub struct AppState {
    /// Token → tenant bucket mapping.
    pub buckets: Arc<BucketManager>,
    /// Channel membership and fan-out.
    pub broker: Arc<ChannelBroker>,
    /// Decides which tokens may connect.
    pub validator: Arc<dyn TokenValidator>,
}

impl AppState {
    /// Assemble the server state.
    pub fn new(buckets: Arc<BucketManager>, validator: Arc<dyn TokenValidator>) -> Self {
        Self {
            buckets,
            broker: Arc::new(ChannelBroker::new()),
            validator,
        }
    }
}

/// Build the server router: `/ws` upgrades, anything else answers 200.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(connection::ws_handler))
        .fallback(|| async { "WebSocket Storage Server" })
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
