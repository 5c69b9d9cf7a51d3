//! Queue module for RabbitMQ operations.
//!
//! This module provides:
//! - A connection manager holding the single shared channel
//! - A publisher that sends JSON values to named queues
//! - A subscriber that turns push deliveries into handler calls with acks
//! - Two broker backends behind one trait: AMQP (lapin) and in-process
//!
//! ## Flow
//!
//! ```text
//! HTTP /send → Publisher → my_queue → Subscriber → handler → ack
//! ```

pub mod amqp;
pub mod broker;
pub mod connection;
pub mod memory;
pub mod publisher;
pub mod subscriber;

pub use broker::{
    BrokerChannel, Connector, ConsumerStream, Delivery, DeliveryTag, Inbound, QueueOptions,
};
pub use connection::{ConnectionManager, SharedChannel};
pub use memory::MemoryBroker;
pub use publisher::Publisher;
pub use subscriber::{FailurePolicy, SubscribeOptions, Subscriber, Subscription};
