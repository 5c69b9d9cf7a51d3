//! Mynth Web Service - HTTP front door to the queue.
//!
//! This binary:
//! - Connects to RabbitMQ once at startup (failure aborts the process)
//! - Accepts JSON on `POST /send` and publishes it to the configured queue
//! - Answers `GET /health`

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use mynth::service::{init_tracing, shutdown_signal};
use mynth::web::{health, send, AppState};
use mynth::{Config, ConnectionManager, Publisher};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("web_server_starting");

    // Load configuration
    let config = Config::from_env();
    info!(
        port = config.port,
        queue = %config.queue_name,
        rabbitmq_url_set = config.rabbitmq_url.is_some(),
        "config_loaded"
    );

    // Connect before serving any traffic
    let manager = ConnectionManager::from_config(&config);
    manager
        .connect()
        .await
        .context("Failed to connect to RabbitMQ")?;

    let state = AppState::new(Publisher::new(manager.clone()), config.queue_name.as_str());

    // Build the router
    let app = Router::new()
        .route("/health", get(health))
        .route("/send", post(send))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            info!("web_server_shutting_down");
        })
        .await
        .context("Server error")?;

    manager.close().await;

    info!("web_server_shutdown_complete");

    Ok(())
}
