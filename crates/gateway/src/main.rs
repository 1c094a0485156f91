//! Gateway service entry point.
//!
//! Relays live match-odds updates: one multiplexed upstream feed
//! connection per watched event, fanned out to WebSocket subscribers.

use anyhow::Result;
use feed::{FeedConfig, FeedService, DEFAULT_UPSTREAM_URL};
use gateway::{create_router, AppState, ClientRegistry};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting odds relay gateway");

    // Read configuration from environment
    let http_port: u16 = env::var("HTTP_PORT")
        .unwrap_or_else(|_| "5000".to_string())
        .parse()
        .expect("HTTP_PORT must be a number");
    let metrics_port: u16 = env::var("METRICS_PORT")
        .unwrap_or_else(|_| "9090".to_string())
        .parse()
        .expect("METRICS_PORT must be a number");
    let upstream_url =
        env::var("UPSTREAM_WS_URL").unwrap_or_else(|_| DEFAULT_UPSTREAM_URL.to_string());

    info!("Configuration:");
    info!("  HTTP_PORT: {}", http_port);
    info!("  METRICS_PORT: {}", metrics_port);
    info!("  UPSTREAM_WS_URL: {}", upstream_url);

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()
        .expect("Failed to start Prometheus exporter");
    info!("Prometheus metrics server started on port {}", metrics_port);

    // Client registry doubles as the feed's broadcast sink
    let registry = Arc::new(ClientRegistry::new());

    let feed_config = FeedConfig {
        upstream_url,
        ..Default::default()
    };
    let feed = FeedService::start(feed_config, registry.clone());

    let state = Arc::new(AppState {
        registry,
        feed: feed.clone(),
    });
    let app = create_router(state);

    // Start HTTP server
    let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Draining feed connections...");
    feed.drain().await;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
