//! AMQP 0-9-1 backend using lapin.
//!
//! One [`Connection`] and one [`Channel`] per `open()`. Messages go through
//! the default exchange with the queue name as routing key.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{info, warn};

use super::broker::{
    BrokerChannel, Connector, ConsumerStream, Delivery, DeliveryTag, Inbound, QueueOptions,
};
use crate::config::BrokerEndpoint;
use crate::error::TransportError;

/// Connector for a real RabbitMQ broker.
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector;

#[async_trait]
impl Connector for AmqpConnector {
    async fn open(&self, endpoint: &BrokerEndpoint) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let connection =
            Connection::connect(endpoint.as_str(), ConnectionProperties::default()).await?;

        info!(
            host = endpoint.host(),
            port = endpoint.port(),
            "rabbitmq_connected"
        );

        let channel = connection.create_channel().await?;

        Ok(Arc::new(AmqpChannel {
            connection,
            channel,
        }))
    }
}

/// Channel plus the connection that owns it.
pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<(), TransportError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: options.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn send(&self, queue: &str, body: &[u8]) -> Result<(), TransportError> {
        // Confirms are not enabled on this channel; the returned
        // PublisherConfirm resolves to NotRequested and is not awaited.
        let _confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<ConsumerStream, TransportError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        let tag = consumer.tag().as_str().to_string();

        // lapin ends the stream when the broker cancels the consumer or the
        // channel closes; surface that as an explicit cancellation event.
        let deliveries = consumer
            .map(|delivery| {
                delivery
                    .map(|d| {
                        Inbound::Message(Delivery {
                            tag: DeliveryTag(d.delivery_tag),
                            body: d.data,
                            redelivered: d.redelivered,
                        })
                    })
                    .map_err(TransportError::from)
            })
            .chain(stream::once(async { Ok(Inbound::Cancelled) }));

        Ok(ConsumerStream {
            tag,
            deliveries: deliveries.boxed(),
        })
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), TransportError> {
        self.channel
            .basic_ack(tag.0, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), TransportError> {
        self.channel
            .basic_nack(
                tag.0,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Err(e) = self.channel.close(200, "Normal shutdown").await {
            warn!(error = %e, "rabbitmq_channel_close_error");
        }
        self.connection.close(200, "Normal shutdown").await?;
        Ok(())
    }
}
