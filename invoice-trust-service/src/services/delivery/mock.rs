use super::{DeliveryChannel, DeliveryError, DeliveryReceipt, RenderedMessage};
use crate::models::Channel;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// In-process channel for tests and local runs. Records what it is asked to
/// send.
pub struct MockChannel {
    channel: Channel,
    enabled: bool,
    failure: Option<String>,
    delay: Option<Duration>,
    send_count: AtomicU64,
    sent: Mutex<Vec<(String, RenderedMessage)>>,
}

impl MockChannel {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            enabled: true,
            failure: None,
            delay: None,
            send_count: AtomicU64::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Every send fails with `error`.
    pub fn failing(mut self, error: &str) -> Self {
        self.failure = Some(error.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Successful sends.
    pub fn send_count(&self) -> u64 {
        self.send_count.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(String, RenderedMessage)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl DeliveryChannel for MockChannel {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(
        &self,
        recipient: &str,
        message: &RenderedMessage,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        if !self.enabled {
            return Err(DeliveryError::NotEnabled(format!(
                "Mock {} channel is not enabled",
                self.channel.as_str()
            )));
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = &self.failure {
            return Err(DeliveryError::SendFailed(error.clone()));
        }

        let n = self.send_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((recipient.to_string(), message.clone()));
        }

        tracing::info!(
            channel = self.channel.as_str(),
            body_length = message.body.len(),
            "[MOCK] Reminder would be sent"
        );

        Ok(DeliveryReceipt {
            provider_message_id: Some(format!("mock-{}-{}", self.channel.as_str(), n)),
        })
    }

    async fn health_check(&self) -> Result<(), DeliveryError> {
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}
