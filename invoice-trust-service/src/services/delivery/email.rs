use super::{DeliveryChannel, DeliveryError, DeliveryReceipt, RenderedMessage};
use crate::config::SmtpConfig;
use crate::models::Channel;
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use secrecy::ExposeSecret;

pub struct SmtpEmailChannel {
    config: SmtpConfig,
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl SmtpEmailChannel {
    pub fn new(config: SmtpConfig) -> Result<Self, DeliveryError> {
        if !config.enabled {
            return Ok(Self {
                config,
                transport: None,
            });
        }

        let creds = Credentials::new(
            config.user.clone(),
            config.password.expose_secret().to_string(),
        );

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| {
                DeliveryError::Configuration(format!("Failed to create SMTP relay: {}", e))
            })?
            .port(config.port)
            .credentials(creds)
            .build();

        Ok(Self {
            config,
            transport: Some(transport),
        })
    }
}

#[async_trait]
impl DeliveryChannel for SmtpEmailChannel {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(
        &self,
        recipient: &str,
        message: &RenderedMessage,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        if !self.config.enabled {
            return Err(DeliveryError::NotEnabled(
                "SMTP email channel is not enabled".to_string(),
            ));
        }

        let transport = self.transport.as_ref().ok_or_else(|| {
            DeliveryError::Configuration("SMTP transport not initialized".to_string())
        })?;

        let from_name = message.from_name.as_ref().unwrap_or(&self.config.from_name);
        let from_mailbox: Mailbox = format!("{} <{}>", from_name, self.config.from_email)
            .parse()
            .map_err(|e| DeliveryError::Configuration(format!("Invalid from address: {}", e)))?;

        let to_mailbox: Mailbox = recipient
            .parse()
            .map_err(|e| DeliveryError::InvalidRecipient(format!("{}: {}", recipient, e)))?;

        let mut builder = Message::builder()
            .from(from_mailbox)
            .to(to_mailbox)
            .subject(message.subject.clone().unwrap_or_default());

        if let Some(reply_to) = &message.reply_to {
            let reply_mailbox: Mailbox = reply_to.parse().map_err(|e| {
                DeliveryError::Configuration(format!("Invalid reply-to address: {}", e))
            })?;
            builder = builder.reply_to(reply_mailbox);
        }

        let email = builder
            .header(ContentType::TEXT_PLAIN)
            .body(message.body.clone())
            .map_err(|e| DeliveryError::SendFailed(format!("Failed to build message: {}", e)))?;

        let response = transport.send(email).await.map_err(|e| {
            if e.is_transient() {
                DeliveryError::Connection(format!("SMTP transient failure: {}", e))
            } else {
                DeliveryError::SendFailed(format!("Failed to send email: {}", e))
            }
        })?;

        let provider_message_id = response.message().next().map(|s| s.to_string());

        tracing::info!("Reminder email sent");

        Ok(DeliveryReceipt {
            provider_message_id,
        })
    }

    async fn health_check(&self) -> Result<(), DeliveryError> {
        if !self.config.enabled {
            return Ok(());
        }

        let transport = self.transport.as_ref().ok_or_else(|| {
            DeliveryError::Configuration("SMTP transport not initialized".to_string())
        })?;

        transport.test_connection().await.map_err(|e| {
            DeliveryError::Connection(format!("SMTP connection test failed: {}", e))
        })?;

        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}
