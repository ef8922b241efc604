use super::sms::normalize_phone;
use super::{DeliveryChannel, DeliveryError, DeliveryReceipt, RenderedMessage};
use crate::config::WhatsAppConfig;
use crate::models::Channel;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

/// WhatsApp Business Cloud API text messages.
pub struct WhatsAppCloudChannel {
    config: WhatsAppConfig,
    client: Client,
}

#[derive(Debug, Serialize)]
struct TextMessageRequest<'a> {
    messaging_product: &'a str,
    to: String,
    #[serde(rename = "type")]
    message_type: &'a str,
    text: TextBody<'a>,
}

#[derive(Debug, Serialize)]
struct TextBody<'a> {
    preview_url: bool,
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: String,
}

impl WhatsAppCloudChannel {
    pub fn new(config: WhatsAppConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/{}/messages",
            self.config.api_url.trim_end_matches('/'),
            self.config.phone_number_id
        )
    }
}

#[async_trait]
impl DeliveryChannel for WhatsAppCloudChannel {
    fn channel(&self) -> Channel {
        Channel::Whatsapp
    }

    async fn send(
        &self,
        recipient: &str,
        message: &RenderedMessage,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        if !self.config.enabled {
            return Err(DeliveryError::NotEnabled(
                "WhatsApp channel is not enabled".to_string(),
            ));
        }

        // The Cloud API takes the number without the leading '+'.
        let phone = normalize_phone(recipient).trim_start_matches('+').to_string();
        if phone.is_empty() {
            return Err(DeliveryError::InvalidRecipient(
                "Phone number is empty".to_string(),
            ));
        }

        let request = TextMessageRequest {
            messaging_product: "whatsapp",
            to: phone,
            message_type: "text",
            text: TextBody {
                preview_url: true,
                body: &message.body,
            },
        };

        let response = self
            .client
            .post(self.messages_url())
            .bearer_auth(self.config.access_token.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                DeliveryError::Connection(format!("Failed to connect to WhatsApp API: {}", e))
            })?;

        let status = response.status();
        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(DeliveryError::RateLimited(
                    "WhatsApp API throttled the request".to_string(),
                ));
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(DeliveryError::Configuration(format!(
                    "WhatsApp API rejected credentials ({})",
                    status
                )));
            }
            _ if !status.is_success() => {
                let body = response.text().await.unwrap_or_default();
                return Err(DeliveryError::SendFailed(format!(
                    "WhatsApp API returned error status {}: {}",
                    status, body
                )));
            }
            _ => {}
        }

        let parsed: SendResponse = response.json().await.map_err(|e| {
            DeliveryError::SendFailed(format!("Failed to parse WhatsApp response: {}", e))
        })?;

        tracing::info!("Reminder WhatsApp message sent");

        Ok(DeliveryReceipt {
            provider_message_id: parsed.messages.into_iter().next().map(|m| m.id),
        })
    }

    async fn health_check(&self) -> Result<(), DeliveryError> {
        if !self.config.enabled {
            return Ok(());
        }

        if self.config.phone_number_id.is_empty() {
            return Err(DeliveryError::Configuration(
                "WhatsApp phone number id is not configured".to_string(),
            ));
        }

        if self.config.access_token.expose_secret().is_empty() {
            return Err(DeliveryError::Configuration(
                "WhatsApp access token is not configured".to_string(),
            ));
        }

        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}
