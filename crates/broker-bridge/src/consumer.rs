//! Consumer callbacks and registration options.
//!
//! A message is acknowledged (AMQP) or deleted (SQS) only after its handler
//! returns `Ok`. A failing handler leaves the message with the broker: AMQP
//! deliveries are nacked, SQS messages become visible again once their
//! visibility timeout expires.

use crate::message::ConsumedMessage;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
#[path = "consumer_tests.rs"]
mod tests;

/// Callback invoked for every consumed message
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: ConsumedMessage) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(ConsumedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: ConsumedMessage) -> anyhow::Result<()> {
        (self)(message).await
    }
}

/// Options for [`crate::MessageProvider::add_consumer`]
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    /// Consumer tag announced to an AMQP broker; generated by the broker when empty
    pub consumer_tag: String,

    /// Requeue AMQP deliveries whose handler failed
    pub requeue_on_failure: bool,

    /// SQS long-poll wait per receive request (0 to 20 seconds)
    pub wait_time: Duration,

    /// Pause before the next receive when a request returned nothing
    pub idle_delay: Duration,

    /// SQS visibility timeout applied to received messages; queue default when `None`
    pub visibility_timeout: Option<Duration>,

    /// Stops the consumer when cancelled
    pub shutdown: Option<CancellationToken>,
}

impl ConsumeOptions {
    /// Longest wait SQS accepts for a single receive request
    pub const MAX_WAIT_TIME: Duration = Duration::from_secs(20);

    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    pub fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time;
        self
    }

    pub fn with_idle_delay(mut self, idle_delay: Duration) -> Self {
        self.idle_delay = idle_delay;
        self
    }

    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    /// Long-poll wait in whole seconds, clamped to what SQS accepts
    pub(crate) fn wait_time_seconds(&self) -> u64 {
        self.wait_time.min(Self::MAX_WAIT_TIME).as_secs()
    }

    /// Token observed by the consumer; a fresh, never-cancelled one when unset
    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone().unwrap_or_default()
    }
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            consumer_tag: String::new(),
            requeue_on_failure: true,
            wait_time: Self::MAX_WAIT_TIME,
            idle_delay: Duration::from_millis(500),
            visibility_timeout: None,
            shutdown: None,
        }
    }
}
