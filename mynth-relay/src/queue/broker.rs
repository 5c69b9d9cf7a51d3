//! Broker abstraction used by the connection manager, publisher and subscriber.
//!
//! A [`Connector`] opens one connection plus one channel and hands back a
//! [`BrokerChannel`]. Everything above this module talks to the channel only
//! through the trait, so the AMQP client and the in-process broker are
//! interchangeable.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::BrokerEndpoint;
use crate::error::TransportError;

/// Broker-assigned token identifying one delivery on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message pushed by the broker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

/// One event on a consumer's delivery stream.
#[derive(Debug)]
pub enum Inbound {
    /// A message carrying content.
    Message(Delivery),
    /// The broker cancelled the consumer. Carries no content.
    Cancelled,
}

/// Push deliveries for one consumer, in broker order.
pub type DeliveryStream = BoxStream<'static, Result<Inbound, TransportError>>;

/// A registered consumer: the tag the broker knows it by, and its deliveries.
pub struct ConsumerStream {
    /// Broker-assigned when the requested tag was empty.
    pub tag: String,
    pub deliveries: DeliveryStream,
}

/// Options used when declaring a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self { durable: true }
    }
}

/// A logical session on one broker connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Channel number, for logging.
    fn id(&self) -> u16;

    /// Ensure the queue exists. Redeclaring with identical options is a no-op.
    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<(), TransportError>;

    /// Hand a message body to the broker for the named queue.
    ///
    /// Returns once the send has been accepted locally; no publisher confirm
    /// is requested.
    async fn send(&self, queue: &str, body: &[u8]) -> Result<(), TransportError>;

    /// Limit unacknowledged deliveries on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError>;

    /// Register a consumer and return its effective tag and delivery stream.
    ///
    /// An empty `consumer_tag` asks the broker to generate one.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<ConsumerStream, TransportError>;

    async fn ack(&self, tag: DeliveryTag) -> Result<(), TransportError>;

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), TransportError>;

    /// Close the channel and its connection.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Opens a connection and a single channel to a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, endpoint: &BrokerEndpoint) -> Result<Arc<dyn BrokerChannel>, TransportError>;
}
