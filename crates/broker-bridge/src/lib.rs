//! # Broker Bridge
//!
//! Unified publish/subscribe facade over an AMQP 0.9.1 broker (exchanges and
//! queues) and AWS SQS with SNS (queues and topics).
//!
//! This library provides:
//! - A single [`MessageBrokerFactory`] that selects a backend from [`ProviderOptions`]
//! - Topic creation, queue-to-topic binding, direct sends and topic publishes
//! - Consumers that acknowledge a message only after its handler succeeded
//! - An optional JSON envelope carrying a message type name
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all broker operations
//! - [`envelope`] - Message type envelope codec
//! - [`message`] - Consumed messages and delivery metadata
//! - [`provider`] - Backend selection and provider options
//! - [`consumer`] - Message handlers and consumer options
//! - [`client`] - Provider trait and the factory
//! - [`providers`] - AMQP and SQS/SNS backends

pub mod client;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod message;
pub mod provider;
pub mod providers;

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

// Re-export commonly used types at crate root for convenience
pub use client::{MessageBrokerFactory, MessageProvider};
pub use consumer::{ConsumeOptions, MessageHandler};
pub use envelope::{decode, encode, try_parse, Envelope, ParsedBody};
pub use error::{BrokerError, ConfigurationError};
pub use message::{ConsumedMessage, DeliveryMetadata};
pub use provider::{BrokerKind, ProviderOptions, TopicConfig, TopicKind};
pub use providers::{ManagedQueueTopicProvider, QueueExchangeProvider, QueueIdentifiers};
pub use tokio_util::sync::CancellationToken;
