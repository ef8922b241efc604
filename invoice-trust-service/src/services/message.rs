//! Reminder message rendering.

use crate::models::{Channel, Invoice, Reminder, ReminderType};
use crate::services::delivery::RenderedMessage;

/// Tenant sender identity for email, when the plan and settings allow it.
#[derive(Debug, Clone, Default)]
pub struct SenderIdentity {
    pub name: Option<String>,
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MessageRenderer {
    public_base_url: String,
}

impl MessageRenderer {
    pub fn new(public_base_url: &str) -> Self {
        Self {
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn verification_link(&self, verification_code: &str) -> String {
        format!("{}/verify/{}", self.public_base_url, verification_code)
    }

    /// Address for the reminder's channel from the buyer snapshot.
    pub fn recipient<'a>(&self, channel: Channel, invoice: &'a Invoice) -> Option<&'a str> {
        let buyer = &invoice.buyer;
        match channel {
            Channel::Email => buyer.email.as_deref(),
            Channel::Whatsapp | Channel::Sms => buyer.phone.as_deref(),
        }
        .map(str::trim)
        .filter(|s| !s.is_empty())
    }

    pub fn render(
        &self,
        reminder: &Reminder,
        invoice: &Invoice,
        sender: &SenderIdentity,
    ) -> RenderedMessage {
        let amount = format!("{} {:.2}", invoice.currency, invoice.total);
        let due = invoice
            .due_date
            .map(|d| d.format("%d %b %Y").to_string())
            .unwrap_or_else(|| "on receipt".to_string());
        let timing = timing_phrase(reminder.reminder_type, reminder.days_offset);
        let link = self.verification_link(&invoice.verification_code);

        match reminder.channel {
            Channel::Email => {
                let body = format!(
                    "Dear {buyer},\n\n\
                     This is a reminder that invoice {number} from {issuer} for {amount} {timing}.\n\
                     Due date: {due}\n\n\
                     You can confirm this invoice is genuine at {link}\n\n\
                     If you have already paid, please disregard this message.\n\n\
                     {issuer}",
                    buyer = invoice.buyer.name,
                    number = invoice.invoice_number,
                    issuer = invoice.issuer_name,
                );
                RenderedMessage {
                    subject: Some(format!(
                        "Payment reminder: invoice {} {}",
                        invoice.invoice_number, timing
                    )),
                    body,
                    from_name: sender.name.clone(),
                    reply_to: sender.reply_to.clone(),
                }
            }
            Channel::Whatsapp => RenderedMessage {
                subject: None,
                body: format!(
                    "Hello {buyer}, invoice *{number}* from {issuer} for *{amount}* {timing} (due {due}). Verify: {link}",
                    buyer = invoice.buyer.name,
                    number = invoice.invoice_number,
                    issuer = invoice.issuer_name,
                ),
                from_name: None,
                reply_to: None,
            },
            Channel::Sms => RenderedMessage {
                subject: None,
                body: format!(
                    "{issuer}: invoice {number} for {amount} {timing}, due {due}. Verify {link}",
                    issuer = invoice.issuer_name,
                    number = invoice.invoice_number,
                ),
                from_name: None,
                reply_to: None,
            },
        }
    }
}

fn timing_phrase(reminder_type: ReminderType, days_offset: i32) -> String {
    let plural = |n: i32| if n == 1 { "day" } else { "days" };
    match reminder_type {
        ReminderType::BeforeDue => {
            let n = days_offset.abs();
            format!("is due in {} {}", n, plural(n))
        }
        ReminderType::OnDue => "is due today".to_string(),
        ReminderType::AfterDue => {
            let n = days_offset.abs();
            format!("is {} {} overdue", n, plural(n))
        }
        ReminderType::Custom => "is awaiting payment".to_string(),
    }
}
