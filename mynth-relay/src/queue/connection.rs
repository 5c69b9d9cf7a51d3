//! Connection manager owning the process's single broker channel.
//!
//! `connect()` validates the endpoint, opens one connection and one channel,
//! and stores the channel so that every [`Publisher`](super::Publisher) and
//! [`Subscriber`](super::Subscriber) built from this manager uses it. There is
//! no retry here; callers decide whether to try again.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{info, warn};

use super::amqp::AmqpConnector;
use super::broker::{BrokerChannel, Connector, QueueOptions};
use crate::config::{BrokerEndpoint, Config};
use crate::error::{QueueError, Result};

/// The channel shared by all queue operations in a process.
///
/// Cheap to clone. Sends are serialized through an internal lock so that a
/// declare followed by a send is never interleaved with another publisher's.
#[derive(Clone)]
pub struct SharedChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    channel: Arc<dyn BrokerChannel>,
    queue_options: QueueOptions,
    send_lock: Mutex<()>,
}

impl SharedChannel {
    fn new(channel: Arc<dyn BrokerChannel>, queue_options: QueueOptions) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                channel,
                queue_options,
                send_lock: Mutex::new(()),
            }),
        }
    }

    pub fn id(&self) -> u16 {
        self.inner.channel.id()
    }

    pub(crate) fn broker(&self) -> &Arc<dyn BrokerChannel> {
        &self.inner.channel
    }

    pub(crate) async fn lock_sends(&self) -> MutexGuard<'_, ()> {
        self.inner.send_lock.lock().await
    }

    /// Declare `queue` with this channel's queue options.
    pub(crate) async fn ensure_queue(&self, queue: &str) -> Result<()> {
        self.inner
            .channel
            .declare_queue(queue, self.inner.queue_options)
            .await
            .map_err(|source| QueueError::QueueDeclaration {
                queue: queue.to_string(),
                source,
            })
    }

    /// Whether both handles refer to the same open channel.
    pub fn same_channel(&self, other: &SharedChannel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for SharedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedChannel").field("id", &self.id()).finish()
    }
}

/// Owns the broker connection and channel for the process.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    endpoint: Option<String>,
    connector: Arc<dyn Connector>,
    queue_options: QueueOptions,
    channel: RwLock<Option<SharedChannel>>,
}

impl ConnectionManager {
    /// Create a manager that will connect to `endpoint` through `connector`.
    ///
    /// The endpoint is not validated until `connect()`.
    pub fn new(endpoint: Option<String>, connector: Arc<dyn Connector>) -> Self {
        Self::with_queue_options(endpoint, connector, QueueOptions::default())
    }

    /// Like [`new`](Self::new), with explicit options for every queue declaration.
    pub fn with_queue_options(
        endpoint: Option<String>,
        connector: Arc<dyn Connector>,
        queue_options: QueueOptions,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                endpoint,
                connector,
                queue_options,
                channel: RwLock::new(None),
            }),
        }
    }

    /// Create a RabbitMQ-backed manager from application configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::with_queue_options(
            config.rabbitmq_url.clone(),
            Arc::new(AmqpConnector),
            QueueOptions {
                durable: config.queue_durable,
            },
        )
    }

    /// Open a fresh connection and channel and make it the shared channel.
    ///
    /// A previously stored channel is replaced, not reused or closed.
    pub async fn connect(&self) -> Result<SharedChannel> {
        let endpoint = BrokerEndpoint::parse(self.inner.endpoint.as_deref())?;

        info!(
            scheme = endpoint.scheme(),
            host = endpoint.host(),
            port = endpoint.port(),
            "rabbitmq_connecting"
        );

        let channel = self
            .inner
            .connector
            .open(&endpoint)
            .await
            .map_err(QueueError::Connection)?;

        let shared = SharedChannel::new(channel, self.inner.queue_options);

        let previous = self.inner.channel.write().await.replace(shared.clone());
        if let Some(previous) = previous {
            info!(
                previous_channel_id = previous.id(),
                channel_id = shared.id(),
                "rabbitmq_channel_replaced"
            );
        }

        info!(channel_id = shared.id(), "rabbitmq_channel_created");

        Ok(shared)
    }

    /// The current shared channel, or `NotInitialized` before `connect()`.
    pub async fn channel(&self) -> Result<SharedChannel> {
        self.inner
            .channel
            .read()
            .await
            .clone()
            .ok_or(QueueError::NotInitialized)
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.channel.read().await.is_some()
    }

    /// Close the channel and connection gracefully.
    pub async fn close(&self) {
        let channel = self.inner.channel.write().await.take();

        if let Some(channel) = channel {
            if let Err(e) = channel.broker().close().await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        info!("rabbitmq_connection_closed");
    }
}
