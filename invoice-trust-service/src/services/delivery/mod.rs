//! Outbound reminder delivery. One `DeliveryChannel` per reminder channel,
//! selected by `DeliveryRouter`.

pub mod email;
pub mod mock;
pub mod sms;
pub mod whatsapp;

use crate::models::Channel;
use crate::services::metrics::record_delivery_attempt;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{instrument, warn};

pub use email::SmtpEmailChannel;
pub use mock::MockChannel;
pub use sms::Msg91SmsChannel;
pub use whatsapp::WhatsAppCloudChannel;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Channel not enabled: {0}")]
    NotEnabled(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Send error: {0}")]
    SendFailed(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Delivery timed out after {0:?}")]
    Timeout(Duration),

    #[error("Rate limited: {0}")]
    RateLimited(String),
}

impl DeliveryError {
    pub fn kind(&self) -> &'static str {
        match self {
            DeliveryError::NotEnabled(_) => "not_enabled",
            DeliveryError::Configuration(_) => "configuration",
            DeliveryError::Connection(_) => "connection",
            DeliveryError::SendFailed(_) => "send_failed",
            DeliveryError::InvalidRecipient(_) => "invalid_recipient",
            DeliveryError::Timeout(_) => "timeout",
            DeliveryError::RateLimited(_) => "rate_limited",
        }
    }
}

/// A message ready for one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedMessage {
    /// Email only.
    pub subject: Option<String>,
    pub body: String,
    pub from_name: Option<String>,
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DeliveryReceipt {
    pub provider_message_id: Option<String>,
}

/// Outcome of one send as seen by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryResult {
    pub success: bool,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
}

impl DeliveryResult {
    pub fn success(provider_message_id: Option<String>) -> Self {
        Self {
            success: true,
            provider_message_id,
            error: None,
        }
    }

    pub fn failure(error: String) -> Self {
        Self {
            success: false,
            provider_message_id: None,
            error: Some(error),
        }
    }
}

#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    fn channel(&self) -> Channel;

    async fn send(
        &self,
        recipient: &str,
        message: &RenderedMessage,
    ) -> Result<DeliveryReceipt, DeliveryError>;

    async fn health_check(&self) -> Result<(), DeliveryError>;

    fn is_enabled(&self) -> bool;
}

/// Routes a send to the channel implementation with a bounded timeout.
pub struct DeliveryRouter {
    channels: HashMap<Channel, Arc<dyn DeliveryChannel>>,
    timeout: Duration,
}

impl DeliveryRouter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            channels: HashMap::new(),
            timeout,
        }
    }

    pub fn with_channel(mut self, channel: Arc<dyn DeliveryChannel>) -> Self {
        self.channels.insert(channel.channel(), channel);
        self
    }

    pub fn enabled_channels(&self) -> Vec<Channel> {
        let mut enabled: Vec<Channel> = self
            .channels
            .values()
            .filter(|c| c.is_enabled())
            .map(|c| c.channel())
            .collect();
        enabled.sort_by_key(|c| c.as_str());
        enabled
    }

    #[instrument(skip(self, message), fields(channel = channel.as_str()))]
    pub async fn send(
        &self,
        channel: Channel,
        recipient: &str,
        message: &RenderedMessage,
    ) -> DeliveryResult {
        let outcome = match self.channels.get(&channel) {
            None => Err(DeliveryError::NotEnabled(format!(
                "No {} channel configured",
                channel.as_str()
            ))),
            Some(provider) => {
                match tokio::time::timeout(self.timeout, provider.send(recipient, message)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(DeliveryError::Timeout(self.timeout)),
                }
            }
        };

        match outcome {
            Ok(receipt) => {
                record_delivery_attempt(channel.as_str(), "success");
                DeliveryResult::success(receipt.provider_message_id)
            }
            Err(e) => {
                record_delivery_attempt(channel.as_str(), e.kind());
                warn!(error = %e, "Delivery failed");
                DeliveryResult::failure(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> RenderedMessage {
        RenderedMessage {
            subject: None,
            body: "hello".to_string(),
            from_name: None,
            reply_to: None,
        }
    }

    #[tokio::test]
    async fn unknown_channel_is_a_failure_not_a_panic() {
        let router = DeliveryRouter::new(Duration::from_secs(1));
        let result = router.send(Channel::Sms, "+15550100", &message()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not enabled"));
    }

    #[tokio::test]
    async fn slow_channel_times_out() {
        let slow = Arc::new(MockChannel::new(Channel::Email).with_delay(Duration::from_millis(200)));
        let router = DeliveryRouter::new(Duration::from_millis(20)).with_channel(slow);
        let result = router.send(Channel::Email, "a@b.test", &message()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn routes_by_channel_tag() {
        let email = Arc::new(MockChannel::new(Channel::Email));
        let sms = Arc::new(MockChannel::new(Channel::Sms));
        let router = DeliveryRouter::new(Duration::from_secs(1))
            .with_channel(email.clone())
            .with_channel(sms.clone());

        let result = router.send(Channel::Sms, "+15550100", &message()).await;
        assert!(result.success);
        assert_eq!(sms.send_count(), 1);
        assert_eq!(email.send_count(), 0);
        assert_eq!(router.enabled_channels(), vec![Channel::Email, Channel::Sms]);
    }
}
