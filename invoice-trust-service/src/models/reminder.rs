//! Reminder model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReminderType {
    BeforeDue,
    OnDue,
    AfterDue,
    Custom,
}

impl ReminderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReminderType::BeforeDue => "before_due",
            ReminderType::OnDue => "on_due",
            ReminderType::AfterDue => "after_due",
            ReminderType::Custom => "custom",
        }
    }

    /// Normalise an offset to the sign this type implies: negative before the
    /// due date, zero on it, positive after. Custom offsets are informational.
    pub fn signed_offset(&self, days: i32) -> i32 {
        match self {
            ReminderType::BeforeDue => -days.abs(),
            ReminderType::OnDue => 0,
            ReminderType::AfterDue => days.abs(),
            ReminderType::Custom => days,
        }
    }

    /// Scheduled relative to the due date.
    pub fn is_relative(&self) -> bool {
        !matches!(self, ReminderType::Custom)
    }
}

impl FromStr for ReminderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "before_due" => Ok(ReminderType::BeforeDue),
            "on_due" => Ok(ReminderType::OnDue),
            "after_due" => Ok(ReminderType::AfterDue),
            "custom" => Ok(ReminderType::Custom),
            _ => Err(format!("Invalid reminder type: {}", s)),
        }
    }
}

/// Delivery channel of a reminder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    Email,
    Whatsapp,
    Sms,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Whatsapp => "whatsapp",
            Channel::Sms => "sms",
        }
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "email" => Ok(Channel::Email),
            "whatsapp" => Ok(Channel::Whatsapp),
            "sms" => Ok(Channel::Sms),
            _ => Err(format!("Invalid channel: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReminderStatus {
    Pending,
    Sent,
    Failed,
    Cancelled,
    Skipped,
}

impl ReminderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReminderStatus::Pending => "pending",
            ReminderStatus::Sent => "sent",
            ReminderStatus::Failed => "failed",
            ReminderStatus::Cancelled => "cancelled",
            ReminderStatus::Skipped => "skipped",
        }
    }

    /// Statuses that occupy a schedule slot.
    pub fn holds_slot(&self) -> bool {
        matches!(
            self,
            ReminderStatus::Pending | ReminderStatus::Sent | ReminderStatus::Failed
        )
    }
}

impl FromStr for ReminderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ReminderStatus::Pending),
            "sent" => Ok(ReminderStatus::Sent),
            "failed" => Ok(ReminderStatus::Failed),
            "cancelled" => Ok(ReminderStatus::Cancelled),
            "skipped" => Ok(ReminderStatus::Skipped),
            _ => Err(format!("Invalid reminder status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Reminder {
    pub reminder_id: Uuid,
    pub tenant_id: Uuid,
    pub invoice_id: Uuid,
    pub reminder_type: ReminderType,
    pub days_offset: i32,
    pub channel: Channel,
    pub scheduled_for: DateTime<Utc>,
    pub status: ReminderStatus,
    #[serde(skip_serializing)]
    pub claimed_until: Option<DateTime<Utc>>,
    /// Set when a provider call starts. Scheduled runs never pick the
    /// reminder up again; only a manual send does.
    pub delivery_attempted_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub provider_message_id: Option<String>,
    pub error_message: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Reminder {
    /// Identity used for duplicate detection among active reminders.
    pub fn slot(&self) -> (Uuid, ReminderType, i32, Channel, DateTime<Utc>) {
        (
            self.invoice_id,
            self.reminder_type,
            self.days_offset,
            self.channel,
            self.scheduled_for,
        )
    }
}

/// A reminder to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReminder {
    pub tenant_id: Uuid,
    pub invoice_id: Uuid,
    pub reminder_type: ReminderType,
    pub days_offset: i32,
    pub channel: Channel,
    pub scheduled_for: DateTime<Utc>,
}

impl NewReminder {
    pub fn slot(&self) -> (Uuid, ReminderType, i32, Channel, DateTime<Utc>) {
        (
            self.invoice_id,
            self.reminder_type,
            self.days_offset,
            self.channel,
            self.scheduled_for,
        )
    }
}

/// Input for a single reminder. `custom_date` is required for CUSTOM and
/// ignored otherwise.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateReminderRequest {
    pub reminder_type: ReminderType,
    #[serde(default)]
    #[validate(range(min = -365, max = 365))]
    pub days_offset: i32,
    pub channel: Option<Channel>,
    pub custom_date: Option<DateTime<Utc>>,
}

/// Which reminders a claim may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimScope {
    /// PENDING and scheduled at or before `now`.
    Due,
    /// PENDING or FAILED regardless of schedule.
    Manual,
}

/// Final state written when a claim completes.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Sent {
        provider_message_id: Option<String>,
    },
    Failed {
        error: String,
    },
    Skipped {
        reason: String,
    },
}

impl DispatchOutcome {
    pub fn status(&self) -> ReminderStatus {
        match self {
            DispatchOutcome::Sent { .. } => ReminderStatus::Sent,
            DispatchOutcome::Failed { .. } => ReminderStatus::Failed,
            DispatchOutcome::Skipped { .. } => ReminderStatus::Skipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_follow_reminder_type() {
        assert_eq!(ReminderType::BeforeDue.signed_offset(3), -3);
        assert_eq!(ReminderType::BeforeDue.signed_offset(-3), -3);
        assert_eq!(ReminderType::OnDue.signed_offset(5), 0);
        assert_eq!(ReminderType::AfterDue.signed_offset(-7), 7);
        assert_eq!(ReminderType::Custom.signed_offset(-2), -2);
    }

    #[test]
    fn channel_serializes_as_upper_case_tag() {
        assert_eq!(
            serde_json::to_string(&Channel::Whatsapp).unwrap(),
            "\"WHATSAPP\""
        );
        assert_eq!("SMS".parse::<Channel>(), Ok(Channel::Sms));
    }

    #[test]
    fn only_live_statuses_hold_a_slot() {
        assert!(ReminderStatus::Sent.holds_slot());
        assert!(!ReminderStatus::Cancelled.holds_slot());
        assert!(!ReminderStatus::Skipped.holds_slot());
    }
}
