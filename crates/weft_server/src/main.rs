use std::sync::Arc;

use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use weft_core::schema::SchemaRegistry;
use weft_server::auth::AllowAll;
use weft_server::buckets::BucketManager;
use weft_server::config::Config;
use weft_server::store::RedisBackend;
use weft_server::{router, AppState};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weft_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting Weft Storage Server v{}", env!("CARGO_PKG_VERSION"));
    info!("Backing store: {} (db {})", config.redis_url, config.redis_database);

    // Connect the backing store
    let backend = match RedisBackend::connect(&config.redis_url, config.redis_database).await {
        Ok(b) => Arc::new(b),
        Err(e) => {
            error!("Failed to connect to the backing store: {}", e);
            std::process::exit(1);
        }
    };

    // Hydrate tenants. Value schemas are supplied by whoever embeds the
    // server; the standalone binary runs without any.
    let buckets = Arc::new(BucketManager::new(backend, Arc::new(SchemaRegistry::new())));
    if let Err(e) = buckets.initialize().await {
        error!("Failed to load tenants: {}", e);
        std::process::exit(1);
    }

    // AllowAll must be replaced with a real validator in production.
    let state = AppState::new(buckets, Arc::new(AllowAll));
    let app = router(state);

    let addr = config.server_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    info!("Server shut down gracefully");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
