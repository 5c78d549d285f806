//! Broker backend implementations.

pub mod amqp;
pub mod aws;
mod aws_query;

pub use amqp::QueueExchangeProvider;
pub use aws::{ManagedQueueTopicProvider, QueueIdentifiers};
