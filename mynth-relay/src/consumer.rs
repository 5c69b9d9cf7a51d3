//! Consumer service loop.
//!
//! This module:
//! 1. Connects to RabbitMQ using the configured URL
//! 2. Subscribes to the configured queue with a logging handler
//! 3. Serves `GET /health`
//! 4. Stops on SIGINT/SIGTERM or when the broker ends the subscription

use std::future::IntoFuture;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use serde_json::Value;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use mynth::service::shutdown_signal;
use mynth::web::health;
use mynth::{Config, ConnectionManager, SubscribeOptions, Subscriber};

/// Run the consumer until shutdown.
pub async fn run(config: Config) -> Result<()> {
    let manager = ConnectionManager::from_config(&config);
    manager
        .connect()
        .await
        .context("Failed to connect to RabbitMQ")?;

    let options = SubscribeOptions {
        consumer_tag: config.consumer_tag.clone(),
        prefetch: config.prefetch_count,
        failure_policy: config.handler_failure_policy,
    };

    let subscription = Subscriber::new(manager.clone())
        .subscribe_with(&config.queue_name, options, handle_message)
        .await
        .context("Failed to start consumer")?;

    let app = Router::new()
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.consumer_port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, queue = %config.queue_name, "consumer_ready");

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .into_future();

    tokio::select! {
        result = server => {
            result.context("Server error")?;
            info!("consumer_stopping");
        }
        _ = subscription.closed() => {
            warn!("consumer_subscription_ended");
        }
    }

    manager.close().await;

    info!("consumer_shutdown_complete");
    Ok(())
}

/// Log each received message.
fn handle_message(message: Value) -> Result<()> {
    info!(message = %message, "message_received");
    Ok(())
}
