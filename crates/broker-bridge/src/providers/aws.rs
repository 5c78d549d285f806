//! AWS SQS + SNS provider.
//!
//! Queues are SQS queues and topics are SNS topics. Assigning a queue to a
//! topic grants the topic permission to deliver into the queue and then
//! subscribes the queue to it. Routing keys have no SNS counterpart and are
//! ignored.
//!
//! Queue URLs/ARNs and topic ARNs are resolved once per name and cached for
//! the life of the provider. Consumption polls the queue with long polling
//! until the consumer's shutdown token is cancelled.

use super::aws_query::{AwsCredentials, AwsError, AwsV4Signer, QueryApiClient, XmlNode};
use crate::client::MessageProvider;
use crate::consumer::{ConsumeOptions, MessageHandler};
use crate::envelope;
use crate::error::{BrokerError, ConfigurationError};
use crate::message::{ConsumedMessage, DeliveryMetadata};
use crate::provider::{BrokerKind, ProviderOptions, TopicConfig, TopicKind};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client as HttpClient;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "aws_tests.rs"]
mod tests;

const SQS_BACKEND: &str = "sqs";
const SNS_BACKEND: &str = "sns";

const SQS_API_VERSION: &str = "2012-11-05";
const SNS_API_VERSION: &str = "2010-03-31";

/// Upper bound for a single HTTP exchange; covers the 20 s long poll
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Identifiers of a resolved SQS queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueIdentifiers {
    pub url: String,
    pub arn: String,
}

/// Provider for SQS queues fed by SNS topics
pub struct ManagedQueueTopicProvider {
    sqs: QueryApiClient,
    sns: QueryApiClient,
    region: String,
    queues: RwLock<HashMap<String, QueueIdentifiers>>,
    topics: RwLock<HashMap<String, String>>,
}

impl ManagedQueueTopicProvider {
    /// Create a provider; no request is made until first use
    pub fn new(options: ProviderOptions) -> Result<Self, ConfigurationError> {
        let region = non_blank(options.region).ok_or(ConfigurationError::MissingAwsCredentials)?;
        let access_key =
            non_blank(options.access_key).ok_or(ConfigurationError::MissingAwsCredentials)?;
        let secret_key =
            non_blank(options.secret_key).ok_or(ConfigurationError::MissingAwsCredentials)?;

        let credentials = AwsCredentials {
            access_key,
            secret_key,
            session_token: non_blank(options.session_token),
        };

        let http_client = HttpClient::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| ConfigurationError::Invalid {
                message: format!("failed to create HTTP client: {}", e),
            })?;

        let sqs_endpoint = non_blank(options.sqs_endpoint)
            .unwrap_or_else(|| format!("https://sqs.{}.amazonaws.com", region));
        let sns_endpoint = non_blank(options.sns_endpoint)
            .unwrap_or_else(|| format!("https://sns.{}.amazonaws.com", region));

        let sqs = QueryApiClient::new(
            http_client.clone(),
            &sqs_endpoint,
            AwsV4Signer::new(credentials.clone(), region.clone(), "sqs"),
            SQS_API_VERSION,
        )?;
        let sns = QueryApiClient::new(
            http_client,
            &sns_endpoint,
            AwsV4Signer::new(credentials, region.clone(), "sns"),
            SNS_API_VERSION,
        )?;

        Ok(Self {
            sqs,
            sns,
            region,
            queues: RwLock::new(HashMap::new()),
            topics: RwLock::new(HashMap::new()),
        })
    }

    /// Cached identifiers of a queue, if it was resolved before
    pub async fn cached_queue(&self, queue: &str) -> Option<QueueIdentifiers> {
        self.queues.read().await.get(queue).cloned()
    }

    /// Cached ARN of a topic, if it was resolved before
    pub async fn cached_topic(&self, topic: &str) -> Option<String> {
        self.topics.read().await.get(topic).cloned()
    }

    async fn sqs_call(
        &self,
        action: &'static str,
        params: &[(&str, &str)],
    ) -> Result<XmlNode, BrokerError> {
        self.sqs
            .call(action, params)
            .await
            .map_err(|e: AwsError| e.into_broker_error(SQS_BACKEND, action))
    }

    async fn sns_call(
        &self,
        action: &'static str,
        params: &[(&str, &str)],
    ) -> Result<XmlNode, BrokerError> {
        self.sns
            .call(action, params)
            .await
            .map_err(|e: AwsError| e.into_broker_error(SNS_BACKEND, action))
    }

    /// Resolve (creating if needed) a queue's URL and ARN
    async fn ensure_queue(&self, queue: &str) -> Result<QueueIdentifiers, BrokerError> {
        if let Some(identifiers) = self.cached_queue(queue).await {
            return Ok(identifiers);
        }

        let response = self.sqs_call("CreateQueue", &[("QueueName", queue)]).await?;
        let url = response
            .find_text("QueueUrl")
            .filter(|url| !url.is_empty())
            .ok_or_else(|| BrokerError::resource_resolution("QueueUrl", "CreateQueue", queue))?
            .to_string();

        let response = self
            .sqs_call(
                "GetQueueAttributes",
                &[("QueueUrl", url.as_str()), ("AttributeName.1", "QueueArn")],
            )
            .await?;
        let arn = response
            .find_all("Attribute")
            .into_iter()
            .find(|attribute| attribute.child_text("Name") == Some("QueueArn"))
            .and_then(|attribute| attribute.child_text("Value"))
            .filter(|arn| !arn.is_empty())
            .ok_or_else(|| {
                BrokerError::resource_resolution("QueueArn", "GetQueueAttributes", queue)
            })?
            .to_string();

        let identifiers = QueueIdentifiers { url, arn };
        debug!(queue, url = %identifiers.url, arn = %identifiers.arn, "Queue resolved");

        let mut queues = self.queues.write().await;
        Ok(queues
            .entry(queue.to_string())
            .or_insert(identifiers)
            .clone())
    }

    /// Resolve (creating if needed) a topic's ARN
    async fn ensure_topic(&self, topic: &str) -> Result<String, BrokerError> {
        if let Some(arn) = self.cached_topic(topic).await {
            return Ok(arn);
        }

        let response = self.sns_call("CreateTopic", &[("Name", topic)]).await?;
        let arn = response
            .find_text("TopicArn")
            .filter(|arn| !arn.is_empty())
            .ok_or_else(|| BrokerError::resource_resolution("TopicArn", "CreateTopic", topic))?
            .to_string();

        debug!(topic, arn = %arn, "Topic resolved");

        let mut topics = self.topics.write().await;
        Ok(topics.entry(topic.to_string()).or_insert(arn).clone())
    }

    /// Receive at most one message, waiting up to the long-poll time
    async fn receive_one(
        &self,
        queue: &str,
        queue_url: &str,
        options: &ConsumeOptions,
    ) -> Result<Option<(String, ConsumedMessage)>, BrokerError> {
        let wait_time = options.wait_time_seconds().to_string();
        let visibility_timeout = options
            .visibility_timeout
            .map(|timeout| timeout.as_secs().to_string());

        let mut params = vec![
            ("QueueUrl", queue_url),
            ("MaxNumberOfMessages", "1"),
            ("WaitTimeSeconds", wait_time.as_str()),
            ("AttributeName.1", "All"),
        ];
        if let Some(timeout) = visibility_timeout.as_deref() {
            params.push(("VisibilityTimeout", timeout));
        }

        let response = self.sqs_call("ReceiveMessage", &params).await?;
        match response.find("Message") {
            Some(message) => parse_message(queue, message).map(Some),
            None => Ok(None),
        }
    }

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<(), BrokerError> {
        self.sqs_call(
            "DeleteMessage",
            &[("QueueUrl", queue_url), ("ReceiptHandle", receipt_handle)],
        )
        .await
        .map(|_| ())
    }
}

impl fmt::Debug for ManagedQueueTopicProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedQueueTopicProvider")
            .field("region", &self.region)
            .field("sqs_endpoint", &self.sqs.endpoint())
            .field("sns_endpoint", &self.sns.endpoint())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MessageProvider for ManagedQueueTopicProvider {
    async fn connect(&self) -> Result<(), BrokerError> {
        // HTTP requests are independent; there is no session to open.
        Ok(())
    }

    async fn create_topic(
        &self,
        name: &str,
        kind: TopicKind,
        _config: &TopicConfig,
    ) -> Result<Option<String>, BrokerError> {
        if kind != TopicKind::Direct {
            debug!(topic = name, kind = %kind, "Topic kind has no SNS counterpart, ignoring");
        }
        self.ensure_topic(name).await.map(Some)
    }

    async fn assign_topic(
        &self,
        queue: &str,
        topic: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let topic_arn = self.ensure_topic(topic).await?;
        let identifiers = self.ensure_queue(queue).await?;

        let policy = topic_delivery_policy(&identifiers.arn, &topic_arn);
        self.sqs_call(
            "SetQueueAttributes",
            &[
                ("QueueUrl", identifiers.url.as_str()),
                ("Attribute.1.Name", "Policy"),
                ("Attribute.1.Value", policy.as_str()),
            ],
        )
        .await?;

        self.sns_call(
            "Subscribe",
            &[
                ("TopicArn", topic_arn.as_str()),
                ("Protocol", "sqs"),
                ("Endpoint", identifiers.arn.as_str()),
            ],
        )
        .await?;

        if !routing_key.is_empty() {
            debug!(queue, topic, routing_key, "Routing key ignored by SNS subscription");
        }
        info!(queue, topic, topic_arn = %topic_arn, "Queue subscribed to topic");
        Ok(())
    }

    async fn send_message(
        &self,
        queue: &str,
        body: &[u8],
        message_type: &str,
    ) -> Result<(), BrokerError> {
        let identifiers = self.ensure_queue(queue).await?;
        let payload = envelope::encode(body, message_type);
        let message_body = String::from_utf8_lossy(&payload).into_owned();

        let response = self
            .sqs_call(
                "SendMessage",
                &[
                    ("QueueUrl", identifiers.url.as_str()),
                    ("MessageBody", message_body.as_str()),
                ],
            )
            .await?;

        debug!(
            queue,
            message_type,
            message_id = response.find_text("MessageId").unwrap_or_default(),
            "Message sent"
        );
        Ok(())
    }

    async fn publish_message(
        &self,
        topic: &str,
        body: &[u8],
        routing_key: &str,
        message_type: &str,
    ) -> Result<(), BrokerError> {
        let topic_arn = self.ensure_topic(topic).await?;
        let payload = envelope::encode(body, message_type);
        let message = String::from_utf8_lossy(&payload).into_owned();

        if !routing_key.is_empty() {
            debug!(topic, routing_key, "Routing key ignored by SNS publish");
        }

        let response = self
            .sns_call(
                "Publish",
                &[
                    ("TopicArn", topic_arn.as_str()),
                    ("Message", message.as_str()),
                ],
            )
            .await?;

        debug!(
            topic,
            message_type,
            message_id = response.find_text("MessageId").unwrap_or_default(),
            "Message published"
        );
        Ok(())
    }

    async fn add_consumer(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        options: ConsumeOptions,
    ) -> Result<(), BrokerError> {
        let identifiers = self.ensure_queue(queue).await?;
        let shutdown = options.shutdown_token();

        info!(queue, url = %identifiers.url, "Polling consumer started");

        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = self.receive_one(queue, &identifiers.url, &options) => received,
            };

            let (receipt_handle, message) = match received {
                Ok(Some(received)) => received,
                Ok(None) => {
                    if idle(&shutdown, options.idle_delay).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    error!(queue, error = %e, "Receive failed, stopping consumer");
                    return Err(e);
                }
            };

            match handler.handle(message).await {
                Ok(()) => {
                    if let Err(e) = self.delete_message(&identifiers.url, &receipt_handle).await {
                        // Handled but not deleted: it reappears after its visibility timeout.
                        error!(queue, error = %e, "Delete failed, stopping consumer");
                        return Err(e);
                    }
                }
                Err(handler_error) => {
                    warn!(
                        queue,
                        error = %handler_error,
                        "Message handler failed, leaving message for redelivery"
                    );
                }
            }
        }

        info!(queue, "Polling consumer stopped");
        Ok(())
    }

    fn broker_kind(&self) -> BrokerKind {
        BrokerKind::ManagedQueueTopic
    }
}

/// Sleep for `delay`; returns true when shutdown was requested meanwhile
async fn idle(shutdown: &tokio_util::sync::CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

/// Parse a received message; returns its receipt handle alongside
fn parse_message(queue: &str, message: &XmlNode) -> Result<(String, ConsumedMessage), BrokerError> {
    let receipt_handle = message
        .child_text("ReceiptHandle")
        .ok_or_else(|| BrokerError::MalformedResponse {
            backend: SQS_BACKEND,
            operation: "ReceiveMessage",
            message: "message without ReceiptHandle".to_string(),
        })?
        .to_string();

    let attributes = message
        .children_named("Attribute")
        .filter_map(|attribute| {
            Some((
                attribute.child_text("Name")?.to_string(),
                attribute.child_text("Value").unwrap_or_default().to_string(),
            ))
        })
        .collect();

    let consumed = ConsumedMessage {
        queue: queue.to_string(),
        body: Bytes::from(message.child_text("Body").unwrap_or_default().to_string()),
        metadata: DeliveryMetadata::Sqs {
            message_id: message.child_text("MessageId").unwrap_or_default().to_string(),
            receipt_handle: receipt_handle.clone(),
            md5_of_body: message.child_text("MD5OfBody").map(str::to_string),
            attributes,
        },
    };
    Ok((receipt_handle, consumed))
}

/// Queue policy allowing `topic_arn` to deliver into `queue_arn`
pub(crate) fn topic_delivery_policy(queue_arn: &str, topic_arn: &str) -> String {
    serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": "sns.amazonaws.com" },
            "Action": "sqs:SendMessage",
            "Resource": queue_arn,
            "Condition": {
                "ArnEquals": { "aws:SourceArn": topic_arn }
            }
        }]
    })
    .to_string()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
