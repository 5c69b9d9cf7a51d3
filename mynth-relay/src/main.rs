//! Mynth Consumer - subscribes to the shared queue and handles each message.
//!
//! Connects once, registers a single subscription, and serves a health
//! endpoint until a shutdown signal arrives or the broker ends the
//! subscription.

mod consumer;

use anyhow::Result;
use tracing::info;

use mynth::service::init_tracing;
use mynth::Config;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("consumer_starting");

    // Load configuration from environment
    let config = Config::from_env();
    info!(
        queue = %config.queue_name,
        port = config.consumer_port,
        rabbitmq_url_set = config.rabbitmq_url.is_some(),
        prefetch_count = ?config.prefetch_count,
        failure_policy = %config.handler_failure_policy,
        "config_loaded"
    );

    consumer::run(config).await?;

    Ok(())
}
