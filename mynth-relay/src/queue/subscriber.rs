//! Queue subscriber: push deliveries in, parsed values out to a handler.
//!
//! `subscribe()` declares the queue, registers a consumer and returns as soon
//! as the broker has accepted the registration. A dedicated task then drains
//! the delivery stream one message at a time:
//!
//! 1. Cancellation events are logged and otherwise ignored.
//! 2. The body is decoded as JSON into the handler's input type. A body that
//!    does not decode is rejected without requeue and never reaches the
//!    handler.
//! 3. The handler runs on the delivery task. A panic is caught and treated
//!    like an `Err`.
//! 4. `Ok` acknowledges the message; `Err` is settled per [`FailurePolicy`].
//!
//! No error on a single message ends the subscription.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::broker::{Delivery, DeliveryStream, Inbound};
use super::connection::{ConnectionManager, SharedChannel};
use crate::error::{QueueError, Result};

/// Longest body prefix written to logs for an undecodable message.
const BODY_PREVIEW_LIMIT: usize = 500;

/// How to settle a message whose handler returned an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Acknowledge anyway; the message is removed from the queue.
    #[default]
    Ack,
    /// Negatively acknowledge without requeue (dead-lettered if configured).
    Reject,
    /// Negatively acknowledge and put the message back on the queue.
    Requeue,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ack" => Ok(Self::Ack),
            "reject" => Ok(Self::Reject),
            "requeue" => Ok(Self::Requeue),
            other => Err(format!("unknown failure policy `{other}`")),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ack => "ack",
            Self::Reject => "reject",
            Self::Requeue => "requeue",
        };
        f.write_str(name)
    }
}

/// Per-subscription settings.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Consumer tag; empty lets the broker generate one.
    pub consumer_tag: String,
    /// QoS prefetch applied to the shared channel before consuming.
    pub prefetch: Option<u16>,
    pub failure_policy: FailurePolicy,
}

/// A registered consumer. Dropping it does not cancel the consumer.
#[derive(Debug)]
pub struct Subscription {
    queue: String,
    consumer_tag: String,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The tag the broker registered, generated by it when none was requested.
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait until the broker stops delivering (consumer cancelled or
    /// channel closed).
    pub async fn closed(self) {
        if let Err(e) = self.task.await {
            error!(queue = %self.queue, error = %e, "subscription_task_failed");
        }
    }
}

/// Registers handlers for queues on the shared channel.
#[derive(Clone)]
pub struct Subscriber {
    manager: ConnectionManager,
}

impl Subscriber {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    /// Subscribe with default options.
    pub async fn subscribe<T, H>(&self, queue: &str, handler: H) -> Result<Subscription>
    where
        T: DeserializeOwned + Send + 'static,
        H: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_with(queue, SubscribeOptions::default(), handler)
            .await
    }

    /// Declare `queue`, register a consumer and start delivering to `handler`.
    ///
    /// Returns once the consumer is registered; it does not wait for messages.
    pub async fn subscribe_with<T, H>(
        &self,
        queue: &str,
        options: SubscribeOptions,
        handler: H,
    ) -> Result<Subscription>
    where
        T: DeserializeOwned + Send + 'static,
        H: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let channel = self.manager.channel().await?;

        if queue.is_empty() {
            return Err(QueueError::InvalidQueueName);
        }

        channel.ensure_queue(queue).await?;

        if let Some(prefetch) = options.prefetch {
            channel
                .broker()
                .set_prefetch(prefetch)
                .await
                .map_err(QueueError::Broker)?;
            info!(prefetch_count = prefetch, "rabbitmq_qos_set");
        }

        let consumer = channel
            .broker()
            .consume(queue, &options.consumer_tag)
            .await
            .map_err(QueueError::Broker)?;

        info!(
            queue = queue,
            channel_id = channel.id(),
            consumer_tag = %consumer.tag,
            failure_policy = %options.failure_policy,
            "rabbitmq_consumer_started"
        );

        let worker = DeliveryWorker {
            queue: queue.to_string(),
            channel,
            failure_policy: options.failure_policy,
            handler,
        };
        let task = tokio::spawn(worker.run::<T>(consumer.deliveries));

        Ok(Subscription {
            queue: queue.to_string(),
            consumer_tag: consumer.tag,
            task,
        })
    }
}

/// Drains one consumer's delivery stream.
struct DeliveryWorker<H> {
    queue: String,
    channel: SharedChannel,
    failure_policy: FailurePolicy,
    handler: H,
}

impl<H> DeliveryWorker<H> {
    async fn run<T>(self, mut deliveries: DeliveryStream)
    where
        T: DeserializeOwned,
        H: Fn(T) -> anyhow::Result<()>,
    {
        while let Some(event) = deliveries.next().await {
            match event {
                Ok(Inbound::Message(delivery)) => self.handle::<T>(delivery).await,
                Ok(Inbound::Cancelled) => {
                    info!(queue = %self.queue, "rabbitmq_consumer_cancelled");
                }
                Err(e) => {
                    error!(queue = %self.queue, error = %e, "rabbitmq_delivery_error");
                }
            }
        }

        warn!(queue = %self.queue, "rabbitmq_consumer_closed");
    }

    async fn handle<T>(&self, delivery: Delivery)
    where
        T: DeserializeOwned,
        H: Fn(T) -> anyhow::Result<()>,
    {
        let tag = delivery.tag;

        info!(
            queue = %self.queue,
            delivery_tag = tag.0,
            body_length = delivery.body.len(),
            redelivered = delivery.redelivered,
            "rabbitmq_message_received"
        );

        let value: T = match serde_json::from_slice(&delivery.body) {
            Ok(value) => value,
            Err(e) => {
                let e = QueueError::Deserialization(e);
                error!(
                    queue = %self.queue,
                    delivery_tag = tag.0,
                    error = %e,
                    body_preview = %String::from_utf8_lossy(
                        &delivery.body[..delivery.body.len().min(BODY_PREVIEW_LIMIT)]
                    ),
                    "rabbitmq_message_parse_failed"
                );
                self.nack(delivery, false).await;
                return;
            }
        };

        let outcome = match catch_unwind(AssertUnwindSafe(|| (self.handler)(value))) {
            Ok(outcome) => outcome,
            Err(payload) => Err(anyhow::anyhow!(
                "handler panicked: {}",
                panic_message(payload.as_ref())
            )),
        };

        match outcome {
            Ok(()) => self.ack(delivery).await,
            Err(e) => {
                error!(
                    queue = %self.queue,
                    delivery_tag = tag.0,
                    error = %e,
                    failure_policy = %self.failure_policy,
                    "rabbitmq_handler_failed"
                );
                match self.failure_policy {
                    FailurePolicy::Ack => self.ack(delivery).await,
                    FailurePolicy::Reject => self.nack(delivery, false).await,
                    FailurePolicy::Requeue => self.nack(delivery, true).await,
                }
            }
        }
    }

    async fn ack(&self, delivery: Delivery) {
        if let Err(e) = self.channel.broker().ack(delivery.tag).await {
            error!(delivery_tag = delivery.tag.0, error = %e, "rabbitmq_ack_failed");
        } else {
            info!(queue = %self.queue, delivery_tag = delivery.tag.0, "rabbitmq_message_acked");
        }
    }

    async fn nack(&self, delivery: Delivery, requeue: bool) {
        if let Err(e) = self.channel.broker().nack(delivery.tag, requeue).await {
            error!(delivery_tag = delivery.tag.0, error = %e, "rabbitmq_nack_failed");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use serde::Deserialize;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use super::*;
    use crate::queue::broker::{DeliveryTag, QueueOptions};
    use crate::queue::memory::MemoryBroker;
    use crate::queue::Publisher;

    async fn connected(broker: &MemoryBroker) -> (ConnectionManager, Publisher, Subscriber) {
        let manager = ConnectionManager::new(
            Some("amqp://localhost:5672".to_string()),
            Arc::new(broker.clone()),
        );
        manager.connect().await.unwrap();
        (
            manager.clone(),
            Publisher::new(manager.clone()),
            Subscriber::new(manager),
        )
    }

    /// Poll `check` until it holds or two seconds pass.
    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for handler")
            .expect("handler channel closed")
    }

    #[test]
    fn test_failure_policy_parse() {
        assert_eq!("ACK".parse::<FailurePolicy>(), Ok(FailurePolicy::Ack));
        assert_eq!("reject".parse::<FailurePolicy>(), Ok(FailurePolicy::Reject));
        assert_eq!("Requeue".parse::<FailurePolicy>(), Ok(FailurePolicy::Requeue));
        assert!("drop".parse::<FailurePolicy>().is_err());
    }

    #[tokio::test]
    async fn test_subscribe_before_connect() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(
            Some("amqp://localhost:5672".to_string()),
            Arc::new(broker.clone()),
        );

        let err = Subscriber::new(manager)
            .subscribe("q", |_: Value| Ok(()))
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::NotInitialized));
        assert_eq!(broker.connect_attempts(), 0);
        assert!(!broker.is_declared("q"));
    }

    #[tokio::test]
    async fn test_subscribe_declares_and_returns_immediately() {
        let broker = MemoryBroker::new();
        let (_, _, subscriber) = connected(&broker).await;

        let subscription = subscriber.subscribe("q", |_: Value| Ok(())).await.unwrap();

        assert!(broker.is_declared("q"));
        assert_eq!(broker.consumer_count("q"), 1);
        assert_eq!(subscription.queue(), "q");
        assert!(!subscription.is_closed());
    }

    #[tokio::test]
    async fn test_subscription_reports_broker_generated_tag() {
        let broker = MemoryBroker::new();
        let (_, _, subscriber) = connected(&broker).await;

        let generated = subscriber.subscribe("q", |_: Value| Ok(())).await.unwrap();
        let named = subscriber
            .subscribe_with(
                "q",
                SubscribeOptions {
                    consumer_tag: "relay-worker".to_string(),
                    ..Default::default()
                },
                |_: Value| Ok(()),
            )
            .await
            .unwrap();

        assert_eq!(generated.consumer_tag(), "amq.ctag-1");
        assert_eq!(named.consumer_tag(), "relay-worker");
    }

    #[tokio::test]
    async fn test_subscribe_declaration_mismatch() {
        let broker = MemoryBroker::new();
        broker
            .declare("q", QueueOptions { durable: false })
            .unwrap();
        let (_, _, subscriber) = connected(&broker).await;

        let err = subscriber.subscribe("q", |_: Value| Ok(())).await.unwrap_err();

        match err {
            QueueError::QueueDeclaration { queue, .. } => assert_eq!(queue, "q"),
            other => panic!("expected QueueDeclaration, got {other:?}"),
        }
        assert_eq!(broker.consumer_count("q"), 0);
    }

    #[tokio::test]
    async fn test_subscribe_empty_queue_name() {
        let broker = MemoryBroker::new();
        let (_, _, subscriber) = connected(&broker).await;

        let err = subscriber.subscribe("", |_: Value| Ok(())).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidQueueName));
    }

    #[tokio::test]
    async fn test_message_is_handled_then_acked() {
        let broker = MemoryBroker::new();
        let (_, publisher, subscriber) = connected(&broker).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        subscriber
            .subscribe("q1", move |value: Value| {
                tx.send(value)?;
                Ok(())
            })
            .await
            .unwrap();
        publisher.publish("q1", &json!({"a": 1})).await.unwrap();

        assert_eq!(recv(&mut rx).await, json!({"a": 1}));
        eventually(|| broker.acked() == vec![DeliveryTag(1)]).await;
        assert!(broker.nacked().is_empty());
    }

    #[tokio::test]
    async fn test_round_trip_json_values() {
        let broker = MemoryBroker::new();
        let (_, publisher, subscriber) = connected(&broker).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        subscriber
            .subscribe("q", move |value: Value| {
                tx.send(value)?;
                Ok(())
            })
            .await
            .unwrap();

        let values = vec![
            json!(null),
            json!(true),
            json!(-12.5),
            json!(9007199254740993u64),
            json!("unicode ✓ \"quoted\""),
            json!([1, "two", [3], {"four": 4}]),
            json!({
                "id": "e2e-test-123",
                "metadata": {"nested": {"department": "engineering"}},
                "payload": {"data": [1, 2, 3, 4, 5], "flags": {"urgent": true, "encrypted": false}}
            }),
            json!({}),
        ];
        for value in &values {
            publisher.publish("q", value).await.unwrap();
        }

        for value in values {
            assert_eq!(recv(&mut rx).await, value);
        }
    }

    #[tokio::test]
    async fn test_typed_handler() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Instruction {
            message: String,
            id: u32,
        }

        let broker = MemoryBroker::new();
        let (_, publisher, subscriber) = connected(&broker).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        subscriber
            .subscribe("q", move |instruction: Instruction| {
                tx.send(instruction)?;
                Ok(())
            })
            .await
            .unwrap();
        publisher
            .publish("q", &json!({"message": "hello", "id": 3}))
            .await
            .unwrap();

        assert_eq!(
            recv(&mut rx).await,
            Instruction {
                message: "hello".to_string(),
                id: 3
            }
        );
    }

    #[tokio::test]
    async fn test_published_before_subscribe_delivered_in_order() {
        let broker = MemoryBroker::new();
        let (_, publisher, subscriber) = connected(&broker).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        for i in 0..10 {
            publisher.publish("q", &json!({ "seq": i })).await.unwrap();
        }
        subscriber
            .subscribe("q", move |value: Value| {
                tx.send(value["seq"].as_i64().unwrap_or(-1))?;
                Ok(())
            })
            .await
            .unwrap();

        for i in 0..10 {
            assert_eq!(recv(&mut rx).await, i);
        }
        eventually(|| broker.acked().len() == 10).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_hundred_messages_each_handled_once() {
        let broker = MemoryBroker::new();
        let (_, publisher, subscriber) = connected(&broker).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let counter = Arc::clone(&calls);
        subscriber
            .subscribe("q", move |value: Value| {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.send(value)?;
                Ok(())
            })
            .await
            .unwrap();

        let sent: Vec<Value> = (0..100)
            .map(|i| json!({"message": format!("Bulk message {i}"), "id": i}))
            .collect();
        for value in &sent {
            publisher.publish("q", value).await.unwrap();
        }

        for value in &sent {
            assert_eq!(&recv(&mut rx).await, value);
        }
        eventually(|| broker.acked().len() == 100).await;
        assert_eq!(calls.load(Ordering::SeqCst), 100);
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_json_does_not_stop_subscription() {
        let broker = MemoryBroker::new();
        let (_, publisher, subscriber) = connected(&broker).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let counter = Arc::clone(&calls);
        let subscription = subscriber
            .subscribe("q", move |value: Value| {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.send(value)?;
                Ok(())
            })
            .await
            .unwrap();

        broker.inject("q", b"{not json".to_vec());
        publisher.publish("q", &json!({"ok": true})).await.unwrap();

        assert_eq!(recv(&mut rx).await, json!({"ok": true}));
        eventually(|| broker.acked() == vec![DeliveryTag(2)]).await;
        assert_eq!(broker.nacked(), vec![(DeliveryTag(1), false)]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!subscription.is_closed());
    }

    #[tokio::test]
    async fn test_cancellation_skips_handler_and_ack() {
        let broker = MemoryBroker::new();
        let (_, _, subscriber) = connected(&broker).await;
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let subscription = subscriber
            .subscribe("q", move |_: Value| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();

        broker.cancel_consumers("q");
        tokio::time::timeout(Duration::from_secs(2), subscription.closed())
            .await
            .expect("subscription did not close");

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(broker.acked().is_empty());
        assert!(broker.nacked().is_empty());
    }

    #[tokio::test]
    async fn test_handler_error_acks_by_default() {
        let broker = MemoryBroker::new();
        let (_, publisher, subscriber) = connected(&broker).await;

        subscriber
            .subscribe("q", |_: Value| anyhow::bail!("handler exploded"))
            .await
            .unwrap();
        publisher.publish("q", &json!(1)).await.unwrap();

        eventually(|| broker.acked() == vec![DeliveryTag(1)]).await;
        assert!(broker.nacked().is_empty());
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let broker = MemoryBroker::new();
        let (_, publisher, subscriber) = connected(&broker).await;
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let subscription = subscriber
            .subscribe("q", move |value: Value| {
                counter.fetch_add(1, Ordering::SeqCst);
                if value["boom"] == json!(true) {
                    panic!("handler blew up");
                }
                Ok(())
            })
            .await
            .unwrap();
        publisher.publish("q", &json!({"boom": true})).await.unwrap();
        publisher.publish("q", &json!({"boom": false})).await.unwrap();

        eventually(|| broker.acked() == vec![DeliveryTag(1), DeliveryTag(2)]).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!subscription.is_closed());
        assert_eq!(broker.consumer_count("q"), 1);
    }

    #[tokio::test]
    async fn test_handler_error_reject_policy() {
        let broker = MemoryBroker::new();
        let (_, publisher, subscriber) = connected(&broker).await;
        let options = SubscribeOptions {
            failure_policy: FailurePolicy::Reject,
            ..Default::default()
        };

        subscriber
            .subscribe_with("q", options, |_: Value| anyhow::bail!("nope"))
            .await
            .unwrap();
        publisher.publish("q", &json!(1)).await.unwrap();

        eventually(|| broker.nacked() == vec![(DeliveryTag(1), false)]).await;
        assert!(broker.acked().is_empty());
        assert_eq!(broker.ready_count("q"), 0);
    }

    #[tokio::test]
    async fn test_handler_error_requeue_policy_redelivers() {
        let broker = MemoryBroker::new();
        let (_, publisher, subscriber) = connected(&broker).await;
        let attempts = Arc::new(AtomicUsize::new(0));
        let options = SubscribeOptions {
            failure_policy: FailurePolicy::Requeue,
            ..Default::default()
        };

        let counter = Arc::clone(&attempts);
        subscriber
            .subscribe_with("q", options, move |_: Value| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("first attempt fails");
                }
                Ok(())
            })
            .await
            .unwrap();
        publisher.publish("q", &json!({"retry": true})).await.unwrap();

        eventually(|| broker.acked().len() == 1).await;
        assert_eq!(broker.nacked(), vec![(DeliveryTag(1), true)]);
        assert_eq!(broker.acked(), vec![DeliveryTag(2)]);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_prefetch_applied() {
        let broker = MemoryBroker::new();
        let (_, _, subscriber) = connected(&broker).await;
        let options = SubscribeOptions {
            prefetch: Some(10),
            ..Default::default()
        };

        subscriber
            .subscribe_with("q", options, |_: Value| Ok(()))
            .await
            .unwrap();

        assert_eq!(broker.prefetch(), Some(10));
    }

    #[tokio::test]
    async fn test_close_ends_subscription() {
        let broker = MemoryBroker::new();
        let (manager, _, subscriber) = connected(&broker).await;
        let subscription = subscriber.subscribe("q", |_: Value| Ok(())).await.unwrap();

        manager.close().await;

        tokio::time::timeout(Duration::from_secs(2), subscription.closed())
            .await
            .expect("subscription did not close");
    }
}
