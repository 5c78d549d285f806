//! Messages handed to consumer callbacks.

use crate::envelope::{self, Envelope};
use bytes::Bytes;
use std::borrow::Cow;
use std::collections::HashMap;

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;

/// A message received from a queue, with the backend's delivery metadata
#[derive(Debug, Clone)]
pub struct ConsumedMessage {
    /// Queue the message was consumed from
    pub queue: String,
    /// Raw payload as stored on the broker
    pub body: Bytes,
    pub metadata: DeliveryMetadata,
}

/// Backend-specific delivery information
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryMetadata {
    Amqp {
        delivery_tag: u64,
        exchange: String,
        routing_key: String,
        redelivered: bool,
        content_type: Option<String>,
    },
    Sqs {
        message_id: String,
        receipt_handle: String,
        md5_of_body: Option<String>,
        /// System attributes such as `ApproximateReceiveCount` and `SentTimestamp`
        attributes: HashMap<String, String>,
    },
}

impl ConsumedMessage {
    /// Body as text, replacing invalid UTF-8 sequences
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Decode the message type envelope, if the body carries one
    pub fn envelope(&self) -> Option<Envelope> {
        envelope::decode(&self.body)
    }

    /// Number of times the broker has delivered this message, when known
    pub fn delivery_count(&self) -> Option<u32> {
        match &self.metadata {
            DeliveryMetadata::Amqp { redelivered, .. } => Some(if *redelivered { 2 } else { 1 }),
            DeliveryMetadata::Sqs { attributes, .. } => attributes
                .get("ApproximateReceiveCount")
                .and_then(|count| count.parse().ok()),
        }
    }
}
