use super::{DeliveryChannel, DeliveryError, DeliveryReceipt, RenderedMessage};
use crate::config::Msg91Config;
use crate::models::Channel;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

const MSG91_API_URL: &str = "https://api.msg91.com/api/v5/flow/";
const TRANSACTIONAL_ROUTE: &str = "4";

pub struct Msg91SmsChannel {
    config: Msg91Config,
    client: Client,
}

#[derive(Debug, Serialize)]
struct Msg91Request<'a> {
    sender: &'a str,
    route: &'a str,
    country: &'a str,
    sms: Vec<Msg91Sms<'a>>,
}

#[derive(Debug, Serialize)]
struct Msg91Sms<'a> {
    message: &'a str,
    to: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Msg91Response {
    #[serde(rename = "type")]
    response_type: String,
    message: String,
    #[serde(default)]
    request_id: Option<String>,
}

/// Digits and a leading `+` only.
pub(crate) fn normalize_phone(raw: &str) -> String {
    raw.chars()
        .enumerate()
        .filter(|(i, c)| c.is_ascii_digit() || (*i == 0 && *c == '+'))
        .map(|(_, c)| c)
        .collect()
}

impl Msg91SmsChannel {
    pub fn new(config: Msg91Config) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl DeliveryChannel for Msg91SmsChannel {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(
        &self,
        recipient: &str,
        message: &RenderedMessage,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        if !self.config.enabled {
            return Err(DeliveryError::NotEnabled(
                "Msg91 SMS channel is not enabled".to_string(),
            ));
        }

        let phone = normalize_phone(recipient);
        if phone.trim_start_matches('+').is_empty() {
            return Err(DeliveryError::InvalidRecipient(
                "Phone number is empty".to_string(),
            ));
        }

        let request = Msg91Request {
            sender: &self.config.sender_id,
            route: TRANSACTIONAL_ROUTE,
            country: &self.config.country_code,
            sms: vec![Msg91Sms {
                message: &message.body,
                to: vec![phone],
            }],
        };

        let response = self
            .client
            .post(MSG91_API_URL)
            .header("authkey", self.config.auth_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| DeliveryError::Connection(format!("Failed to connect to Msg91: {}", e)))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(DeliveryError::RateLimited("Msg91 throttled the request".to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::SendFailed(format!(
                "Msg91 API returned error status {}: {}",
                status, body
            )));
        }

        let parsed: Msg91Response = response.json().await.map_err(|e| {
            DeliveryError::SendFailed(format!("Failed to parse Msg91 response: {}", e))
        })?;

        if parsed.response_type != "success" {
            return Err(DeliveryError::SendFailed(format!(
                "Msg91 error: {}",
                parsed.message
            )));
        }

        tracing::info!("Reminder SMS sent via Msg91");

        Ok(DeliveryReceipt {
            provider_message_id: parsed.request_id,
        })
    }

    async fn health_check(&self) -> Result<(), DeliveryError> {
        if !self.config.enabled {
            return Ok(());
        }

        if self.config.auth_key.expose_secret().is_empty() {
            return Err(DeliveryError::Configuration(
                "Msg91 auth key is not configured".to_string(),
            ));
        }

        if self.config.sender_id.is_empty() {
            return Err(DeliveryError::Configuration(
                "Msg91 sender id is not configured".to_string(),
            ));
        }

        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}
