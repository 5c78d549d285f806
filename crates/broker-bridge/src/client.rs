//! Provider trait and the broker factory.

use crate::consumer::{ConsumeOptions, MessageHandler};
use crate::error::{BrokerError, ConfigurationError};
use crate::provider::{BrokerKind, ProviderOptions, TopicConfig, TopicKind};
use crate::providers::{ManagedQueueTopicProvider, QueueExchangeProvider};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

/// Interface implemented by each broker backend.
///
/// Providers own their connection state and resource identifier caches.
/// Operations are not serialized internally: callers should finish topic and
/// queue setup before issuing concurrent message traffic on the same names.
#[async_trait]
pub trait MessageProvider: Send + Sync {
    /// Establish connectivity. Calling it again reuses the existing connection.
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Ensure a topic (exchange) exists.
    ///
    /// Returns the backend resource identifier when the backend addresses
    /// topics by one (SNS topic ARN), `None` otherwise.
    async fn create_topic(
        &self,
        name: &str,
        kind: TopicKind,
        config: &TopicConfig,
    ) -> Result<Option<String>, BrokerError>;

    /// Bind a queue to a topic so that publishes reach the queue.
    ///
    /// Not atomic: a failure part-way leaves earlier steps applied. Every
    /// step is idempotent so the call can be retried.
    async fn assign_topic(
        &self,
        queue: &str,
        topic: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Send a message straight to a queue, enveloped when `message_type` is not empty
    async fn send_message(
        &self,
        queue: &str,
        body: &[u8],
        message_type: &str,
    ) -> Result<(), BrokerError>;

    /// Publish a message to a topic for fan-out, enveloped when `message_type` is not empty
    async fn publish_message(
        &self,
        topic: &str,
        body: &[u8],
        routing_key: &str,
        message_type: &str,
    ) -> Result<(), BrokerError>;

    /// Deliver every message arriving on `queue` to `handler`, one at a time.
    ///
    /// Push-based providers return once the consumer is registered.
    /// Poll-based providers keep receiving until `options.shutdown` is
    /// cancelled, so they should be run on a dedicated task.
    async fn add_consumer(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        options: ConsumeOptions,
    ) -> Result<(), BrokerError>;

    /// Get the backend kind
    fn broker_kind(&self) -> BrokerKind;
}

/// Single entry point selecting and owning a provider
pub struct MessageBrokerFactory {
    provider: Box<dyn MessageProvider>,
}

impl MessageBrokerFactory {
    /// Validate `options` and construct the matching provider.
    ///
    /// No network I/O happens here.
    pub fn new(options: ProviderOptions) -> Result<Self, ConfigurationError> {
        options.validate()?;

        let provider: Box<dyn MessageProvider> = match options.broker_kind {
            BrokerKind::QueueExchange => Box::new(QueueExchangeProvider::new(options)?),
            BrokerKind::ManagedQueueTopic => Box::new(ManagedQueueTopicProvider::new(options)?),
        };

        info!(broker_kind = %provider.broker_kind(), "Message broker constructed");
        Ok(Self { provider })
    }

    /// Wrap an already constructed provider
    pub fn with_provider(provider: Box<dyn MessageProvider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &dyn MessageProvider {
        self.provider.as_ref()
    }

    pub fn broker_kind(&self) -> BrokerKind {
        self.provider.broker_kind()
    }

    pub async fn connect(&self) -> Result<(), BrokerError> {
        self.provider.connect().await
    }

    pub async fn create_topic(
        &self,
        name: &str,
        kind: impl Into<TopicKind> + Send,
        config: &TopicConfig,
    ) -> Result<Option<String>, BrokerError> {
        self.provider.create_topic(name, kind.into(), config).await
    }

    pub async fn assign_topic(
        &self,
        queue: &str,
        topic: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.provider.assign_topic(queue, topic, routing_key).await
    }

    pub async fn send(
        &self,
        queue: &str,
        body: &[u8],
        message_type: &str,
    ) -> Result<(), BrokerError> {
        self.provider.send_message(queue, body, message_type).await
    }

    pub async fn publish_message(
        &self,
        topic: &str,
        body: &[u8],
        routing_key: &str,
        message_type: &str,
    ) -> Result<(), BrokerError> {
        self.provider
            .publish_message(topic, body, routing_key, message_type)
            .await
    }

    pub async fn add_consumer(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        options: ConsumeOptions,
    ) -> Result<(), BrokerError> {
        self.provider.add_consumer(queue, handler, options).await
    }
}

impl std::fmt::Debug for MessageBrokerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBrokerFactory")
            .field("broker_kind", &self.broker_kind())
            .finish()
    }
}
