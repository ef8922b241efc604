//! Invoice issuance and lifecycle.

use crate::models::{
    DeliveryStatus, Feature, Invoice, NewInvoice, PaymentStatus, StatusUpdate, Tenant,
};
use crate::services::metrics::{
    record_invoice_issued, record_quota_rejection, record_reminder_transition,
};
use crate::services::quota::QuotaGate;
use crate::services::reminders::ReminderScheduler;
use crate::services::store::TrustStore;
use crate::services::verification::{generate_verification_code, VerificationEngine};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

pub const DEFAULT_TEMPLATE: &str = "classic";

/// Load an invoice and check it belongs to `tenant_id`.
pub(crate) async fn owned_invoice(
    store: &dyn TrustStore,
    tenant_id: Uuid,
    invoice_id: Uuid,
) -> Result<Invoice, AppError> {
    let invoice = store
        .get_invoice(invoice_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;

    if invoice.tenant_id != tenant_id {
        warn!(
            tenant_id = %tenant_id,
            invoice_id = %invoice_id,
            "Cross-tenant invoice access rejected"
        );
        return Err(AppError::Unauthorized(anyhow::anyhow!(
            "Invoice belongs to another tenant"
        )));
    }

    Ok(invoice)
}

pub(crate) async fn load_tenant(
    store: &dyn TrustStore,
    tenant_id: Uuid,
) -> Result<Tenant, AppError> {
    store
        .get_tenant(tenant_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Tenant not found")))
}

fn validate_amounts(input: &NewInvoice) -> Result<(), AppError> {
    if let Some(due) = input.due_date {
        if due < input.issue_date {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Due date cannot be before issue date"
            )));
        }
    }

    for (idx, item) in input.line_items.iter().enumerate() {
        if item.quantity <= Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Line item {}: quantity must be positive",
                idx + 1
            )));
        }
        if item.unit_price < Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Line item {}: unit price cannot be negative",
                idx + 1
            )));
        }
        if item.tax_rate < Decimal::ZERO || item.tax_rate > Decimal::from(100) {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Line item {}: tax rate must be between 0 and 100",
                idx + 1
            )));
        }
    }

    Ok(())
}

pub struct InvoiceService {
    store: Arc<dyn TrustStore>,
    quota: Arc<QuotaGate>,
    engine: Arc<VerificationEngine>,
    scheduler: Arc<ReminderScheduler>,
}

impl InvoiceService {
    pub fn new(
        store: Arc<dyn TrustStore>,
        quota: Arc<QuotaGate>,
        engine: Arc<VerificationEngine>,
        scheduler: Arc<ReminderScheduler>,
    ) -> Self {
        Self {
            store,
            quota,
            engine,
            scheduler,
        }
    }

    /// Issue and seal an invoice, consuming one unit of the invoices quota.
    /// Creates the default reminder set when the tenant is eligible.
    #[instrument(skip(self, input), fields(tenant_id = %tenant_id, invoice_number = %input.invoice_number))]
    pub async fn issue(&self, tenant_id: Uuid, input: NewInvoice) -> Result<Invoice, AppError> {
        input.validate()?;
        validate_amounts(&input)?;

        let payment_status = input.payment_status.unwrap_or(PaymentStatus::Pending);
        if !matches!(payment_status, PaymentStatus::Draft | PaymentStatus::Pending) {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Invoices are issued as DRAFT or PENDING"
            )));
        }

        let tenant = load_tenant(self.store.as_ref(), tenant_id).await?;

        let template_id = input
            .template_id
            .clone()
            .unwrap_or_else(|| DEFAULT_TEMPLATE.to_string());
        if !self.quota.can_use_template(tenant_id, &template_id).await {
            record_quota_rejection(&tenant_id.to_string(), "templates");
            return Err(AppError::QuotaExceeded {
                feature: "templates".to_string(),
            });
        }

        let (line_items, subtotal, tax_total, total) = input.price()?;

        self.quota.try_consume(tenant_id, Feature::Invoices, 1).await?;

        let now = Utc::now();
        let mut invoice = Invoice {
            invoice_id: Uuid::new_v4(),
            tenant_id,
            invoice_number: input.invoice_number,
            issuer_name: input.issuer_name,
            buyer: input.buyer,
            currency: input.currency.to_uppercase(),
            issue_date: input.issue_date,
            due_date: input.due_date,
            line_items,
            subtotal,
            tax_total,
            total,
            payment_status,
            delivery_status: DeliveryStatus::Draft,
            template_id,
            verification_code: generate_verification_code(),
            sealed_hash: String::new(),
            created_utc: now,
            updated_utc: now,
        };
        invoice.sealed_hash = self.engine.seal(&invoice)?;

        self.store.insert_invoice(&invoice).await?;
        record_invoice_issued(&tenant_id.to_string());
        info!(invoice_id = %invoice.invoice_id, "Invoice issued and sealed");

        if tenant.settings.reminders.enabled && self.reminders_eligible(&tenant, &invoice).await {
            if let Err(e) = self.scheduler.schedule_default_set(&tenant, &invoice).await {
                warn!(
                    invoice_id = %invoice.invoice_id,
                    error = %e,
                    "Failed to create default reminders for new invoice"
                );
            }
        }

        Ok(invoice)
    }

    pub async fn get(&self, tenant_id: Uuid, invoice_id: Uuid) -> Result<Invoice, AppError> {
        owned_invoice(self.store.as_ref(), tenant_id, invoice_id).await
    }

    /// Update payment or delivery status. Settling an invoice cancels its
    /// pending reminders.
    #[instrument(skip(self, update), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub async fn update_status(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        update: StatusUpdate,
    ) -> Result<Invoice, AppError> {
        if update.payment_status.is_none() && update.delivery_status.is_none() {
            return Err(AppError::BadRequest(anyhow::anyhow!("Nothing to update")));
        }

        let current = owned_invoice(self.store.as_ref(), tenant_id, invoice_id).await?;
        if let Some(next) = update.payment_status {
            if current.payment_status == PaymentStatus::Cancelled && next != PaymentStatus::Cancelled
            {
                return Err(AppError::InvalidState(anyhow::anyhow!(
                    "Cancelled invoices cannot be reopened"
                )));
            }
        }

        let updated = self
            .store
            .update_invoice_status(invoice_id, update.payment_status, update.delivery_status)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;

        if updated.payment_status.is_settled() {
            let cancelled = self
                .store
                .cancel_pending_for_invoice(invoice_id, false)
                .await?;
            if cancelled > 0 {
                record_reminder_transition("cancelled", cancelled);
                info!(cancelled, "Cancelled pending reminders of settled invoice");
            }
        }

        Ok(updated)
    }

    /// Move the due date. Pending due-date relative reminders are cancelled
    /// and the default set is rebuilt from the new date; CUSTOM reminders and
    /// delivery history are kept.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub async fn change_due_date(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        due_date: NaiveDate,
    ) -> Result<Invoice, AppError> {
        let current = owned_invoice(self.store.as_ref(), tenant_id, invoice_id).await?;
        if current.payment_status.is_settled() {
            return Err(AppError::InvalidState(anyhow::anyhow!(
                "Invoice is {}",
                current.payment_status.as_str()
            )));
        }
        if due_date < current.issue_date {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Due date cannot be before issue date"
            )));
        }

        let updated = self
            .store
            .update_due_date(invoice_id, due_date)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;

        let cancelled = self
            .store
            .cancel_pending_for_invoice(invoice_id, true)
            .await?;
        if cancelled > 0 {
            record_reminder_transition("cancelled", cancelled);
        }

        // A moved set is rebuilt even when automatic reminders are off.
        let tenant = load_tenant(self.store.as_ref(), tenant_id).await?;
        if (cancelled > 0 || tenant.settings.reminders.enabled)
            && self.reminders_eligible(&tenant, &updated).await
        {
            self.scheduler.schedule_default_set(&tenant, &updated).await?;
        }

        info!(cancelled, due_date = %due_date, "Invoice due date changed");
        Ok(updated)
    }

    async fn reminders_eligible(&self, tenant: &Tenant, invoice: &Invoice) -> bool {
        invoice.due_date.is_some()
            && !invoice.payment_status.is_settled()
            && self
                .quota
                .check_limit(tenant.tenant_id, Feature::AutomatedReminders)
                .await
    }
}
