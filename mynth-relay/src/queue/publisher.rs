//! Async RabbitMQ publisher for enqueueing JSON messages.
//!
//! The publisher holds no channel of its own: each call looks up the channel
//! stored by [`ConnectionManager::connect`] and fails with `NotInitialized`
//! when there is none.

use serde::Serialize;
use tracing::info;

use super::connection::ConnectionManager;
use crate::error::{QueueError, Result};

/// Publishes values to named queues over the shared channel.
#[derive(Clone)]
pub struct Publisher {
    manager: ConnectionManager,
}

impl Publisher {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    /// Serialize `payload` as JSON and send it to `queue`.
    ///
    /// Order of checks: channel present, queue name non-empty, payload
    /// serializable. Only then is the queue declared and the body sent, so a
    /// value that cannot be encoded never causes network I/O.
    ///
    /// Success means the broker client accepted the bytes, not that the
    /// broker has stored them.
    pub async fn publish<T>(&self, queue: &str, payload: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let channel = self.manager.channel().await?;

        if queue.is_empty() {
            return Err(QueueError::InvalidQueueName);
        }

        let body = serde_json::to_vec(payload).map_err(QueueError::Serialization)?;

        let _guard = channel.lock_sends().await;

        channel.ensure_queue(queue).await?;

        channel
            .broker()
            .send(queue, &body)
            .await
            .map_err(QueueError::Broker)?;

        info!(
            queue = queue,
            channel_id = channel.id(),
            body_length = body.len(),
            "rabbitmq_message_published"
        );

        Ok(())
    }
}
