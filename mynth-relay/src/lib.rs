//! Mynth relay - RabbitMQ hand-off between two services.
//!
//! This library provides shared modules for the two Mynth binaries:
//! - `mynth-web`: HTTP service that publishes request bodies to a queue
//! - `mynth-consumer`: Service that subscribes to the queue and handles each message
//!
//! ## Architecture
//!
//! ```text
//! POST /send → Web Service → my_queue → Consumer → handler
//! ```
//!
//! Both sides share one connection and one channel per process, owned by
//! [`ConnectionManager`]. Messages travel as UTF-8 JSON bodies with no
//! envelope.

pub mod config;
pub mod error;
pub mod queue;
pub mod service;
pub mod web;

// Re-export commonly used types
pub use config::{BrokerEndpoint, Config};
pub use error::{QueueError, Result, TransportError};
pub use queue::{
    ConnectionManager, FailurePolicy, Publisher, SharedChannel, SubscribeOptions, Subscriber,
    Subscription,
};
pub use web::AppState;
