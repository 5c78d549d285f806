//! AMQP 0.9.1 provider (RabbitMQ and compatible brokers).
//!
//! Topics map onto exchanges, queues are declared durable, and bindings carry
//! a routing key. One connection and one channel are opened lazily and shared
//! by every operation of the provider.
//!
//! Consumption is push-based: `add_consumer` registers a consumer with
//! prefetch 1 and returns; the client library then hands each delivery to a
//! delegate which runs the handler and acks (or nacks) the delivery.

use crate::client::MessageProvider;
use crate::consumer::{ConsumeOptions, MessageHandler};
use crate::envelope;
use crate::error::{BrokerError, ConfigurationError};
use crate::message::{ConsumedMessage, DeliveryMetadata};
use crate::provider::{redact_uri, BrokerKind, ProviderOptions, TopicConfig, TopicKind};
use async_trait::async_trait;
use bytes::Bytes;
use lapin::message::{Delivery, DeliveryResult};
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "amqp_tests.rs"]
mod tests;

const BACKEND: &str = "amqp";

/// Deliveries in flight per consumer
const PREFETCH_COUNT: u16 = 1;

/// Connection and channel shared by all operations
struct AmqpSession {
    // Held so the connection lives as long as the provider.
    _connection: Connection,
    channel: Channel,
}

/// Provider for exchange/queue brokers
pub struct QueueExchangeProvider {
    connection_uri: String,
    session: OnceCell<AmqpSession>,
}

impl QueueExchangeProvider {
    /// Create a provider; no connection is opened until first use
    pub fn new(options: ProviderOptions) -> Result<Self, ConfigurationError> {
        let connection_uri = options
            .connection_uri
            .filter(|uri| !uri.trim().is_empty())
            .ok_or(ConfigurationError::MissingConnectionUri)?;

        Ok(Self {
            connection_uri,
            session: OnceCell::new(),
        })
    }

    /// The shared channel, connecting on first use
    async fn channel(&self) -> Result<&Channel, BrokerError> {
        let session = self
            .session
            .get_or_try_init(|| async {
                let uri = redact_uri(&self.connection_uri);
                info!(uri = %uri, "Connecting to AMQP broker");

                let connection = Connection::connect(
                    &self.connection_uri,
                    ConnectionProperties::default().with_connection_name("broker-bridge".into()),
                )
                .await
                .map_err(|e| BrokerError::ConnectionFailed {
                    backend: BACKEND,
                    message: format!("connection to {} failed: {}", uri, e),
                })?;

                let channel = connection.create_channel().await.map_err(|e| {
                    BrokerError::ConnectionFailed {
                        backend: BACKEND,
                        message: format!("channel creation failed: {}", e),
                    }
                })?;

                channel
                    .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
                    .await
                    .map_err(|e| amqp_error("basic_qos", e))?;

                channel
                    .confirm_select(ConfirmSelectOptions::default())
                    .await
                    .map_err(|e| amqp_error("confirm_select", e))?;

                Ok::<_, BrokerError>(AmqpSession {
                    _connection: connection,
                    channel,
                })
            })
            .await?;

        Ok(&session.channel)
    }

    /// Declare a durable queue
    async fn assert_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let channel = self.channel().await?;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| amqp_error("queue_declare", e))?;

        debug!(queue, "Queue asserted");
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        message_type: &str,
    ) -> Result<(), BrokerError> {
        let channel = self.channel().await?;
        let payload = envelope::encode(body, message_type);

        let mut properties = BasicProperties::default();
        if !message_type.is_empty() {
            properties = properties
                .with_content_type("application/json".into())
                .with_type(message_type.into());
        }

        let confirm = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| amqp_error("basic_publish", e))?;

        let confirmation = confirm
            .await
            .map_err(|e| amqp_error("publisher_confirm", e))?;
        if confirmation.is_nack() {
            return Err(BrokerError::Backend {
                backend: BACKEND,
                operation: "publisher_confirm",
                code: "NACK".to_string(),
                message: format!("broker rejected message for exchange '{}'", exchange),
                transient: true,
            });
        }

        debug!(
            exchange,
            routing_key,
            message_type,
            size = payload.len(),
            "Message published"
        );
        Ok(())
    }
}

impl fmt::Debug for QueueExchangeProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueExchangeProvider")
            .field("connection_uri", &redact_uri(&self.connection_uri))
            .field("connected", &self.session.initialized())
            .finish()
    }
}

#[async_trait]
impl MessageProvider for QueueExchangeProvider {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.channel().await.map(|_| ())
    }

    async fn create_topic(
        &self,
        name: &str,
        kind: TopicKind,
        config: &TopicConfig,
    ) -> Result<Option<String>, BrokerError> {
        let channel = self.channel().await?;
        channel
            .exchange_declare(
                name,
                exchange_kind(&kind),
                ExchangeDeclareOptions {
                    durable: config.durable,
                    auto_delete: config.auto_delete,
                    internal: config.internal,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| amqp_error("exchange_declare", e))?;

        debug!(exchange = name, kind = %kind, "Exchange asserted");
        Ok(None)
    }

    async fn assign_topic(
        &self,
        queue: &str,
        topic: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.assert_queue(queue).await?;

        let channel = self.channel().await?;
        channel
            .queue_bind(
                queue,
                topic,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| amqp_error("queue_bind", e))?;

        info!(queue, exchange = topic, routing_key, "Queue bound to exchange");
        Ok(())
    }

    async fn send_message(
        &self,
        queue: &str,
        body: &[u8],
        message_type: &str,
    ) -> Result<(), BrokerError> {
        self.assert_queue(queue).await?;
        // The default exchange routes by queue name.
        self.publish("", queue, body, message_type).await
    }

    async fn publish_message(
        &self,
        topic: &str,
        body: &[u8],
        routing_key: &str,
        message_type: &str,
    ) -> Result<(), BrokerError> {
        self.create_topic(topic, TopicKind::Direct, &TopicConfig::default())
            .await?;
        self.publish(topic, routing_key, body, message_type).await
    }

    async fn add_consumer(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        options: ConsumeOptions,
    ) -> Result<(), BrokerError> {
        self.assert_queue(queue).await?;

        let channel = self.channel().await?;
        channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await
            .map_err(|e| amqp_error("basic_qos", e))?;

        let consumer = channel
            .basic_consume(
                queue,
                &options.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| amqp_error("basic_consume", e))?;

        let consumer_tag = consumer.tag().as_str().to_string();
        let queue_name = queue.to_string();
        let requeue_on_failure = options.requeue_on_failure;

        consumer.set_delegate(move |delivery: DeliveryResult| {
            let handler = Arc::clone(&handler);
            let queue = queue_name.clone();
            async move {
                match delivery {
                    Ok(Some(delivery)) => {
                        process_delivery(&queue, handler.as_ref(), delivery, requeue_on_failure)
                            .await
                    }
                    Ok(None) => info!(queue = %queue, "Consumer cancelled by broker"),
                    Err(e) => error!(queue = %queue, error = %e, "Consumer delivery failed"),
                }
            }
        });

        if let Some(token) = options.shutdown {
            let channel = channel.clone();
            let tag = consumer_tag.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                if let Err(e) = channel.basic_cancel(&tag, BasicCancelOptions::default()).await {
                    warn!(consumer_tag = %tag, error = %e, "Failed to cancel consumer");
                }
            });
        }

        info!(queue, consumer_tag = %consumer_tag, "Consumer registered");
        Ok(())
    }

    fn broker_kind(&self) -> BrokerKind {
        BrokerKind::QueueExchange
    }
}

/// Run the handler for one delivery, then ack on success or nack on failure
async fn process_delivery(
    queue: &str,
    handler: &dyn MessageHandler,
    mut delivery: Delivery,
    requeue_on_failure: bool,
) {
    let delivery_tag = delivery.delivery_tag;
    let message = ConsumedMessage {
        queue: queue.to_string(),
        body: Bytes::from(std::mem::take(&mut delivery.data)),
        metadata: delivery_metadata(&delivery),
    };

    let settlement = Settlement::for_outcome(handler.handle(message).await, requeue_on_failure);
    let result = match settlement {
        Settlement::Ack => delivery.acker.ack(BasicAckOptions::default()).await,
        Settlement::Nack { requeue, reason } => {
            warn!(
                queue,
                delivery_tag,
                requeue,
                error = %reason,
                "Message handler failed, rejecting delivery"
            );
            delivery
                .acker
                .nack(BasicNackOptions {
                    requeue,
                    ..Default::default()
                })
                .await
        }
    };
    if let Err(e) = result {
        error!(queue, delivery_tag, error = %e, "Failed to settle delivery");
    }
}

/// How a delivery is settled once its handler has finished
#[derive(Debug)]
enum Settlement {
    Ack,
    Nack { requeue: bool, reason: anyhow::Error },
}

impl Settlement {
    fn for_outcome(outcome: anyhow::Result<()>, requeue_on_failure: bool) -> Self {
        match outcome {
            Ok(()) => Settlement::Ack,
            Err(reason) => Settlement::Nack {
                requeue: requeue_on_failure,
                reason,
            },
        }
    }
}

fn delivery_metadata(delivery: &Delivery) -> DeliveryMetadata {
    DeliveryMetadata::Amqp {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        content_type: delivery
            .properties
            .content_type()
            .as_ref()
            .map(|content_type| content_type.as_str().to_string()),
    }
}

fn exchange_kind(kind: &TopicKind) -> ExchangeKind {
    match kind {
        TopicKind::Direct => ExchangeKind::Direct,
        TopicKind::Fanout => ExchangeKind::Fanout,
        TopicKind::Topic => ExchangeKind::Topic,
        TopicKind::Headers => ExchangeKind::Headers,
        TopicKind::Custom(custom) => ExchangeKind::Custom(custom.clone()),
    }
}

/// Map a client library error onto the bridge taxonomy
fn amqp_error(operation: &'static str, error: lapin::Error) -> BrokerError {
    let transient = matches!(
        error,
        lapin::Error::IOError(_)
            | lapin::Error::InvalidChannelState(_)
            | lapin::Error::InvalidConnectionState(_)
    );

    BrokerError::Backend {
        backend: BACKEND,
        operation,
        code: "AMQP".to_string(),
        message: error.to_string(),
        transient,
    }
}
