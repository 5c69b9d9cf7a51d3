//! In-process broker implementing the same channel contract as AMQP.
//!
//! Queues are FIFO, deliveries get increasing tags, unacknowledged messages
//! are tracked until acked or nacked, and closing a channel requeues what it
//! still held. Consumers on one queue are served round-robin.
//!
//! The broker also records what happened to it (connection attempts, sends,
//! acks, nacks) so tests can assert on side effects without a RabbitMQ
//! server.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;

use super::broker::{
    BrokerChannel, Connector, ConsumerStream, Delivery, DeliveryTag, Inbound, QueueOptions,
};
use crate::config::BrokerEndpoint;
use crate::error::TransportError;

type ConsumerSender = UnboundedSender<Result<Inbound, TransportError>>;

/// Shared in-process broker. Clones refer to the same broker.
///
/// Meant for tests and local runs: the send/ack/nack history grows with every
/// message and is never trimmed, so it is not a production transport.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    connect_attempts: usize,
    refuse_reason: Option<String>,
    last_endpoint: Option<String>,
    next_channel: u16,
    next_tag: u64,
    next_consumer_tag: u64,
    queues: HashMap<String, MemoryQueue>,
    unacked: HashMap<DeliveryTag, Unacked>,
    sent: Vec<(String, Vec<u8>)>,
    acked: Vec<DeliveryTag>,
    nacked: Vec<(DeliveryTag, bool)>,
    prefetch: Option<u16>,
}

struct MemoryQueue {
    options: QueueOptions,
    ready: VecDeque<(Vec<u8>, bool)>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
}

struct Consumer {
    channel: u16,
    sender: ConsumerSender,
}

struct Unacked {
    channel: u16,
    queue: String,
    body: Vec<u8>,
}

impl MemoryQueue {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        }
    }
}

impl BrokerState {
    fn declare(&mut self, queue: &str, options: QueueOptions) -> Result<(), TransportError> {
        match self.queues.get(queue) {
            Some(existing) if existing.options != options => Err(TransportError::Memory(format!(
                "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{queue}'"
            ))),
            Some(_) => Ok(()),
            None => {
                self.queues
                    .insert(queue.to_string(), MemoryQueue::new(options));
                Ok(())
            }
        }
    }

    /// Push ready messages to live consumers until one side runs out.
    fn dispatch(&mut self, queue: &str) {
        let Some(q) = self.queues.get_mut(queue) else {
            return;
        };

        loop {
            q.consumers.retain(|c| !c.sender.is_closed());
            if q.consumers.is_empty() {
                break;
            }
            let Some((body, redelivered)) = q.ready.pop_front() else {
                break;
            };

            self.next_tag += 1;
            let tag = DeliveryTag(self.next_tag);
            let idx = q.next_consumer % q.consumers.len();
            q.next_consumer = q.next_consumer.wrapping_add(1);

            let consumer = &q.consumers[idx];
            self.unacked.insert(
                tag,
                Unacked {
                    channel: consumer.channel,
                    queue: queue.to_string(),
                    body: body.clone(),
                },
            );

            let delivery = Delivery {
                tag,
                body,
                redelivered,
            };
            if let Err(err) = consumer
                .sender
                .unbounded_send(Ok(Inbound::Message(delivery)))
            {
                // Receiver went away between the liveness check and the send.
                self.unacked.remove(&tag);
                if let Ok(Inbound::Message(d)) = err.into_inner() {
                    q.ready.push_front((d.body, d.redelivered));
                }
            }
        }
    }

    fn requeue(&mut self, unacked: Unacked) {
        if let Some(q) = self.queues.get_mut(&unacked.queue) {
            q.ready.push_front((unacked.body, true));
        }
        self.dispatch(&unacked.queue);
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A panic while holding the lock leaves plain bookkeeping data behind.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every following `open()` fail with `reason`.
    pub fn refuse_connections(&self, reason: impl Into<String>) {
        self.lock().refuse_reason = Some(reason.into());
    }

    /// Declare a queue directly on the broker.
    pub fn declare(&self, queue: &str, options: QueueOptions) -> Result<(), TransportError> {
        self.lock().declare(queue, options)
    }

    /// Enqueue a raw body, bypassing any publisher. Declares the queue with
    /// default options if it does not exist yet.
    pub fn inject(&self, queue: &str, body: impl Into<Vec<u8>>) {
        let mut state = self.lock();
        if !state.queues.contains_key(queue) {
            state
                .queues
                .insert(queue.to_string(), MemoryQueue::new(QueueOptions::default()));
        }
        if let Some(q) = state.queues.get_mut(queue) {
            q.ready.push_back((body.into(), false));
        }
        state.dispatch(queue);
    }

    /// Cancel every consumer on `queue`, as RabbitMQ does when a queue is deleted.
    pub fn cancel_consumers(&self, queue: &str) {
        let mut state = self.lock();
        if let Some(q) = state.queues.get_mut(queue) {
            for consumer in q.consumers.drain(..) {
                let _ = consumer.sender.unbounded_send(Ok(Inbound::Cancelled));
            }
        }
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    /// Endpoint passed to the most recent `open()`.
    pub fn last_endpoint(&self) -> Option<String> {
        self.lock().last_endpoint.clone()
    }

    pub fn is_declared(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Bodies sent to `queue`, in send order.
    pub fn sent(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .sent
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub fn total_sent(&self) -> usize {
        self.lock().sent.len()
    }

    /// Messages waiting for a consumer.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| {
            q.consumers
                .iter()
                .filter(|c| !c.sender.is_closed())
                .count()
        })
    }

    pub fn acked(&self) -> Vec<DeliveryTag> {
        self.lock().acked.clone()
    }

    pub fn nacked(&self) -> Vec<(DeliveryTag, bool)> {
        self.lock().nacked.clone()
    }

    pub fn prefetch(&self) -> Option<u16> {
        self.lock().prefetch
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn open(&self, endpoint: &BrokerEndpoint) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        state.last_endpoint = Some(endpoint.as_str().to_string());

        if let Some(reason) = &state.refuse_reason {
            return Err(TransportError::Memory(reason.clone()));
        }

        state.next_channel += 1;
        Ok(Arc::new(MemoryChannel {
            broker: self.clone(),
            id: state.next_channel,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Channel handed out by [`MemoryBroker`].
pub struct MemoryChannel {
    broker: MemoryBroker,
    id: u16,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Memory(format!("channel {} is closed", self.id)));
        }
        Ok(())
    }

    fn settle(&self, state: &mut BrokerState, tag: DeliveryTag) -> Result<Unacked, TransportError> {
        match state.unacked.remove(&tag) {
            Some(entry) if entry.channel == self.id => Ok(entry),
            Some(entry) => {
                state.unacked.insert(tag, entry);
                Err(TransportError::Memory(format!(
                    "PRECONDITION_FAILED - delivery tag {tag} belongs to another channel"
                )))
            }
            None => Err(TransportError::Memory(format!(
                "PRECONDITION_FAILED - unknown delivery tag {tag}"
            ))),
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn id(&self) -> u16 {
        self.id
    }

    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.broker.lock().declare(queue, options)
    }

    async fn send(&self, queue: &str, body: &[u8]) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        state.sent.push((queue.to_string(), body.to_vec()));

        // Default exchange: unroutable messages are silently dropped.
        if let Some(q) = state.queues.get_mut(queue) {
            q.ready.push_back((body.to_vec(), false));
            state.dispatch(queue);
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.broker.lock().prefetch = Some(count);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<ConsumerStream, TransportError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        let q = state.queues.get_mut(queue).ok_or_else(|| {
            TransportError::Memory(format!("NOT_FOUND - no queue '{queue}'"))
        })?;

        let (sender, receiver) = unbounded();
        q.consumers.push(Consumer {
            channel: self.id,
            sender,
        });

        let tag = if consumer_tag.is_empty() {
            state.next_consumer_tag += 1;
            format!("amq.ctag-{}", state.next_consumer_tag)
        } else {
            consumer_tag.to_string()
        };
        state.dispatch(queue);

        Ok(ConsumerStream {
            tag,
            deliveries: receiver.boxed(),
        })
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        self.settle(&mut state, tag)?;
        state.acked.push(tag);
        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        let entry = self.settle(&mut state, tag)?;
        state.nacked.push((tag, requeue));
        if requeue {
            state.requeue(entry);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut state = self.broker.lock();
        for q in state.queues.values_mut() {
            q.consumers.retain(|c| c.channel != self.id);
        }

        let mut orphaned: Vec<(DeliveryTag, Unacked)> = Vec::new();
        let tags: Vec<DeliveryTag> = state
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == self.id)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags {
            if let Some(entry) = state.unacked.remove(&tag) {
                orphaned.push((tag, entry));
            }
        }
        // Requeue in original delivery order so the oldest ends up first.
        orphaned.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        for (_, entry) in orphaned {
            state.requeue(entry);
        }
        Ok(())
    }
}
