//! Tenant and per-tenant settings.

use super::plan::PlanTier;
use super::reminder::Channel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct Tenant {
    pub tenant_id: Uuid,
    pub name: String,
    pub plan: PlanTier,
    pub settings: TenantSettings,
    pub created_utc: DateTime<Utc>,
}

/// Settings stored as JSON on the tenant row. Missing keys take defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenantSettings {
    #[serde(default)]
    pub reminders: ReminderSettings,
    #[serde(default)]
    pub integrations: IntegrationSettings,
}

/// Automated reminder preferences.
///
/// Defaults: enabled, EMAIL, 3 and 1 days before, on the due date, and
/// 1, 3 and 7 days after; sent at 09:00 UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReminderSettings {
    pub enabled: bool,
    pub channel: Channel,
    pub days_before: Vec<u32>,
    pub on_due: bool,
    pub days_after: Vec<u32>,
    pub send_hour_utc: u32,
}

impl Default for ReminderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            channel: Channel::Email,
            days_before: vec![3, 1],
            on_due: true,
            days_after: vec![1, 3, 7],
            send_hour_utc: 9,
        }
    }
}

/// Outbound integrations. Email reminders always go through the platform
/// mailer; `email_enabled` switches on the tenant's own sender name and
/// reply-to (plan permitting). WhatsApp and SMS need their flag set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationSettings {
    pub email_enabled: bool,
    pub sender_name: Option<String>,
    pub reply_to: Option<String>,
    pub whatsapp_enabled: bool,
    pub sms_enabled: bool,
}

impl IntegrationSettings {
    pub fn channel_enabled(&self, channel: Channel) -> bool {
        match channel {
            Channel::Email => true,
            Channel::Whatsapp => self.whatsapp_enabled,
            Channel::Sms => self.sms_enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_settings_document_uses_defaults() {
        let settings: TenantSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, TenantSettings::default());
        assert!(settings.reminders.enabled);
        assert_eq!(settings.reminders.channel, Channel::Email);
        assert_eq!(settings.reminders.days_before, vec![3, 1]);
        assert_eq!(settings.reminders.days_after, vec![1, 3, 7]);
        assert!(!settings.integrations.whatsapp_enabled);
    }

    #[test]
    fn partial_settings_keep_remaining_defaults() {
        let settings: TenantSettings =
            serde_json::from_str(r#"{"reminders":{"channel":"SMS","on_due":false}}"#).unwrap();
        assert_eq!(settings.reminders.channel, Channel::Sms);
        assert!(!settings.reminders.on_due);
        assert_eq!(settings.reminders.days_after, vec![1, 3, 7]);
        assert!(!settings.integrations.channel_enabled(Channel::Sms));
        assert!(settings.integrations.channel_enabled(Channel::Email));
    }
}
