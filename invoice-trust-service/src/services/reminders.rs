//! Reminder scheduling against invoice due dates.

use crate::models::{
    ClaimScope, CreateReminderRequest, Feature, Invoice, NewReminder, Reminder, ReminderSettings,
    ReminderStatus, ReminderType, Tenant,
};
use crate::services::invoices::{load_tenant, owned_invoice};
use crate::services::metrics::{record_reminder_transition, record_reminders_created};
use crate::services::quota::QuotaGate;
use crate::services::store::TrustStore;
use crate::workers::dispatch::ReminderDispatchWorker;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use service_core::error::AppError;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// `due + offset_days` at `hour:00` UTC.
pub fn schedule_time(
    due: NaiveDate,
    offset_days: i32,
    hour_utc: u32,
) -> Result<DateTime<Utc>, AppError> {
    let day = due
        .checked_add_signed(Duration::days(i64::from(offset_days)))
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("Reminder date out of range")))?;
    let time = NaiveTime::from_hms_opt(hour_utc.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    Ok(Utc.from_utc_datetime(&day.and_time(time)))
}

/// Offsets of the default set: before due (negative), on due, after due.
pub fn default_offsets(settings: &ReminderSettings) -> Vec<(ReminderType, i32)> {
    let mut before: Vec<i32> = settings.days_before.iter().map(|d| *d as i32).collect();
    before.sort_unstable_by(|a, b| b.cmp(a));
    before.dedup();
    let mut after: Vec<i32> = settings.days_after.iter().map(|d| *d as i32).collect();
    after.sort_unstable();
    after.dedup();

    let mut offsets: Vec<(ReminderType, i32)> = before
        .into_iter()
        .filter(|d| *d > 0)
        .map(|d| (ReminderType::BeforeDue, ReminderType::BeforeDue.signed_offset(d)))
        .collect();
    if settings.on_due {
        offsets.push((ReminderType::OnDue, 0));
    }
    offsets.extend(
        after
            .into_iter()
            .filter(|d| *d > 0)
            .map(|d| (ReminderType::AfterDue, ReminderType::AfterDue.signed_offset(d))),
    );
    offsets
}

/// The default reminder set for an invoice with a due date.
pub fn build_default_set(
    invoice: &Invoice,
    settings: &ReminderSettings,
) -> Result<Vec<NewReminder>, AppError> {
    let due = invoice
        .due_date
        .ok_or_else(|| AppError::InvalidState(anyhow::anyhow!("Invoice has no due date")))?;

    default_offsets(settings)
        .into_iter()
        .map(|(reminder_type, days_offset)| -> Result<NewReminder, AppError> {
            Ok(NewReminder {
                tenant_id: invoice.tenant_id,
                invoice_id: invoice.invoice_id,
                reminder_type,
                days_offset,
                channel: settings.channel,
                scheduled_for: schedule_time(due, days_offset, settings.send_hour_utc)?,
            })
        })
        .collect()
}

fn ensure_open(invoice: &Invoice) -> Result<(), AppError> {
    if invoice.payment_status.is_settled() {
        return Err(AppError::InvalidState(anyhow::anyhow!(
            "Invoice is {}",
            invoice.payment_status.as_str()
        )));
    }
    Ok(())
}

pub struct ReminderScheduler {
    store: Arc<dyn TrustStore>,
    quota: Arc<QuotaGate>,
    dispatcher: Arc<ReminderDispatchWorker>,
}

impl ReminderScheduler {
    pub fn new(
        store: Arc<dyn TrustStore>,
        quota: Arc<QuotaGate>,
        dispatcher: Arc<ReminderDispatchWorker>,
    ) -> Self {
        Self {
            store,
            quota,
            dispatcher,
        }
    }

    /// Replace the invoice's default set. Cancelled and skipped leftovers are
    /// removed and occupied slots are kept, so re-running is not additive.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub async fn create_default_set(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Vec<Reminder>, AppError> {
        let invoice = owned_invoice(self.store.as_ref(), tenant_id, invoice_id).await?;
        if invoice.due_date.is_none() {
            return Err(AppError::InvalidState(anyhow::anyhow!(
                "Invoice has no due date"
            )));
        }
        ensure_open(&invoice)?;
        self.quota
            .require(tenant_id, Feature::AutomatedReminders)
            .await?;

        let tenant = load_tenant(self.store.as_ref(), tenant_id).await?;
        self.schedule_default_set(&tenant, &invoice).await
    }

    /// Write the default set for an already checked invoice.
    pub(crate) async fn schedule_default_set(
        &self,
        tenant: &Tenant,
        invoice: &Invoice,
    ) -> Result<Vec<Reminder>, AppError> {
        let fresh = build_default_set(invoice, &tenant.settings.reminders)?;
        let pending = self
            .store
            .replace_default_set(invoice.invoice_id, &fresh)
            .await?;

        let mut by_type: BTreeMap<&'static str, u64> = BTreeMap::new();
        for reminder in &fresh {
            *by_type.entry(reminder.reminder_type.as_str()).or_default() += 1;
        }
        let tenant_label = tenant.tenant_id.to_string();
        for (reminder_type, count) in by_type {
            record_reminders_created(&tenant_label, reminder_type, count);
        }

        info!(
            invoice_id = %invoice.invoice_id,
            pending = pending.len(),
            "Default reminder set scheduled"
        );
        Ok(pending)
    }

    /// Add one reminder. CUSTOM needs `custom_date`; other types are placed
    /// relative to the due date.
    #[instrument(skip(self, request), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub async fn create_single(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        request: CreateReminderRequest,
    ) -> Result<Reminder, AppError> {
        request.validate()?;
        let invoice = owned_invoice(self.store.as_ref(), tenant_id, invoice_id).await?;
        ensure_open(&invoice)?;
        self.quota
            .require(tenant_id, Feature::AutomatedReminders)
            .await?;

        let tenant = load_tenant(self.store.as_ref(), tenant_id).await?;
        let settings = &tenant.settings.reminders;
        let channel = request.channel.unwrap_or(settings.channel);
        let days_offset = request.reminder_type.signed_offset(request.days_offset);

        let scheduled_for = match request.reminder_type {
            ReminderType::Custom => request.custom_date.ok_or_else(|| {
                AppError::BadRequest(anyhow::anyhow!("CUSTOM reminders require custom_date"))
            })?,
            _ => {
                let due = invoice.due_date.ok_or_else(|| {
                    AppError::InvalidState(anyhow::anyhow!("Invoice has no due date"))
                })?;
                schedule_time(due, days_offset, settings.send_hour_utc)?
            }
        };

        let reminder = self
            .store
            .insert_reminder(&NewReminder {
                tenant_id,
                invoice_id,
                reminder_type: request.reminder_type,
                days_offset,
                channel,
                scheduled_for,
            })
            .await?;

        record_reminders_created(&tenant_id.to_string(), reminder.reminder_type.as_str(), 1);
        info!(reminder_id = %reminder.reminder_id, "Reminder created");
        Ok(reminder)
    }

    /// PENDING to CANCELLED. Terminal or in-flight reminders are returned
    /// unchanged.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, reminder_id = %reminder_id))]
    pub async fn cancel(&self, tenant_id: Uuid, reminder_id: Uuid) -> Result<Reminder, AppError> {
        let reminder = self.owned_reminder(tenant_id, reminder_id).await?;
        if reminder.status != ReminderStatus::Pending {
            return Ok(reminder);
        }

        if self.store.cancel_reminder(reminder_id).await? {
            record_reminder_transition(ReminderStatus::Cancelled.as_str(), 1);
        } else {
            warn!("Reminder is being dispatched, cancel not applied");
        }

        self.store
            .get_reminder(reminder_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Reminder not found")))
    }

    /// Cancel every pending reminder of an invoice.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub async fn cancel_all_for_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<u64, AppError> {
        owned_invoice(self.store.as_ref(), tenant_id, invoice_id).await?;
        let cancelled = self
            .store
            .cancel_pending_for_invoice(invoice_id, false)
            .await?;
        if cancelled > 0 {
            record_reminder_transition(ReminderStatus::Cancelled.as_str(), cancelled);
        }
        info!(cancelled, "Pending reminders cancelled");
        Ok(cancelled)
    }

    pub async fn list(&self, tenant_id: Uuid, invoice_id: Uuid) -> Result<Vec<Reminder>, AppError> {
        owned_invoice(self.store.as_ref(), tenant_id, invoice_id).await?;
        self.store.list_reminders(invoice_id).await
    }

    /// Deliver a PENDING or FAILED reminder now, ignoring its schedule.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, reminder_id = %reminder_id))]
    pub async fn send_now(&self, tenant_id: Uuid, reminder_id: Uuid) -> Result<Reminder, AppError> {
        let reminder = self.owned_reminder(tenant_id, reminder_id).await?;
        if !matches!(
            reminder.status,
            ReminderStatus::Pending | ReminderStatus::Failed
        ) {
            return Err(AppError::InvalidState(anyhow::anyhow!(
                "Reminder is {}",
                reminder.status.as_str()
            )));
        }

        self.dispatcher
            .dispatch_one(reminder_id, ClaimScope::Manual)
            .await?
            .ok_or_else(|| {
                AppError::Conflict(anyhow::anyhow!("Reminder is already being dispatched"))
            })
    }

    async fn owned_reminder(&self, tenant_id: Uuid, reminder_id: Uuid) -> Result<Reminder, AppError> {
        let reminder = self
            .store
            .get_reminder(reminder_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Reminder not found")))?;
        if reminder.tenant_id != tenant_id {
            warn!("Cross-tenant reminder access rejected");
            return Err(AppError::Unauthorized(anyhow::anyhow!(
                "Reminder belongs to another tenant"
            )));
        }
        Ok(reminder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn schedule_time_applies_offset_and_hour() {
        let due = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let before = schedule_time(due, -3, 9).unwrap();
        assert_eq!(before.date_naive(), NaiveDate::from_ymd_opt(2025, 2, 26).unwrap());
        assert_eq!(before.hour(), 9);

        let after = schedule_time(due, 7, 30).unwrap();
        assert_eq!(after.date_naive(), NaiveDate::from_ymd_opt(2025, 3, 8).unwrap());
        assert_eq!(after.hour(), 23);
    }

    #[test]
    fn default_offsets_cover_before_on_and_after_due() {
        let offsets: Vec<i32> = default_offsets(&ReminderSettings::default())
            .into_iter()
            .map(|(_, d)| d)
            .collect();
        assert_eq!(offsets, vec![-3, -1, 0, 1, 3, 7]);
    }

    #[test]
    fn default_offsets_drop_duplicates_and_zero() {
        let settings = ReminderSettings {
            days_before: vec![1, 0, 1],
            on_due: false,
            days_after: vec![5, 2, 5],
            ..ReminderSettings::default()
        };
        let offsets = default_offsets(&settings);
        assert_eq!(
            offsets,
            vec![
                (ReminderType::BeforeDue, -1),
                (ReminderType::AfterDue, 2),
                (ReminderType::AfterDue, 5),
            ]
        );
    }
}
