//! Storage seams. `Database` (Postgres) and `InMemoryStore` implement these.

use crate::models::{
    ClaimScope, CounterKind, DeliveryStatus, DispatchOutcome, Invoice, NewReminder,
    NewVerificationLog, PaymentStatus, QuotaCounter, Reminder, Tenant, VerificationLog,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use service_core::error::AppError;
use uuid::Uuid;

#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn get_tenant(&self, tenant_id: Uuid) -> Result<Option<Tenant>, AppError>;

    async fn count_team_members(&self, tenant_id: Uuid) -> Result<i64, AppError>;
}

#[async_trait]
pub trait InvoiceStore: Send + Sync {
    /// Persist a sealed invoice with its line items.
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), AppError>;

    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError>;

    async fn get_invoice_by_code(&self, code: &str) -> Result<Option<Invoice>, AppError>;

    /// Update the mutable lifecycle fields. `None` leaves a field unchanged.
    async fn update_invoice_status(
        &self,
        invoice_id: Uuid,
        payment_status: Option<PaymentStatus>,
        delivery_status: Option<DeliveryStatus>,
    ) -> Result<Option<Invoice>, AppError>;

    async fn update_due_date(
        &self,
        invoice_id: Uuid,
        due_date: NaiveDate,
    ) -> Result<Option<Invoice>, AppError>;
}

#[async_trait]
pub trait ReminderStore: Send + Sync {
    /// In one transaction: delete CANCELLED/SKIPPED reminders of the invoice,
    /// insert `reminders` skipping occupied slots, and return the invoice's
    /// PENDING reminders.
    async fn replace_default_set(
        &self,
        invoice_id: Uuid,
        reminders: &[NewReminder],
    ) -> Result<Vec<Reminder>, AppError>;

    /// Insert one reminder. An occupied slot is a `Conflict`.
    async fn insert_reminder(&self, reminder: &NewReminder) -> Result<Reminder, AppError>;

    async fn get_reminder(&self, reminder_id: Uuid) -> Result<Option<Reminder>, AppError>;

    async fn list_reminders(&self, invoice_id: Uuid) -> Result<Vec<Reminder>, AppError>;

    /// PENDING and unclaimed to CANCELLED. Returns whether a row changed.
    async fn cancel_reminder(&self, reminder_id: Uuid) -> Result<bool, AppError>;

    /// Cancel every unclaimed PENDING reminder of an invoice, optionally only
    /// the due-date relative ones. Returns the number cancelled.
    async fn cancel_pending_for_invoice(
        &self,
        invoice_id: Uuid,
        only_relative: bool,
    ) -> Result<u64, AppError>;

    /// PENDING reminders scheduled at or before `before` with no live claim,
    /// oldest first.
    async fn list_due_reminders(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Reminder>, AppError>;

    /// Atomically take a lease on a reminder. Returns the claimed reminder, or
    /// `None` if another worker holds it or its state no longer qualifies.
    async fn claim_reminder(
        &self,
        reminder_id: Uuid,
        scope: ClaimScope,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Reminder>, AppError>;

    /// Record that delivery is starting, only while the caller's lease is
    /// live. Returns false when the lease has lapsed.
    async fn mark_delivery_attempt(
        &self,
        reminder_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// Write the final state of a claimed reminder and release the lease.
    async fn complete_reminder(
        &self,
        reminder_id: Uuid,
        outcome: &DispatchOutcome,
        now: DateTime<Utc>,
    ) -> Result<Option<Reminder>, AppError>;
}

#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Read the tenant's counter, persisting a window reset first when the
    /// window has elapsed. Creates the counter on first use.
    async fn load_counter(
        &self,
        tenant_id: Uuid,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<QuotaCounter, AppError>;

    /// Reset if due, then add `amount` to `kind` only if the result stays
    /// within `limit` (`None` for unlimited). One atomic operation. Returns
    /// the updated counter, or `None` when the limit would be exceeded.
    async fn try_increment(
        &self,
        tenant_id: Uuid,
        kind: CounterKind,
        amount: i64,
        limit: Option<i64>,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<Option<QuotaCounter>, AppError>;
}

#[async_trait]
pub trait VerificationLogStore: Send + Sync {
    async fn record_verification(&self, entry: &NewVerificationLog) -> Result<(), AppError>;

    async fn list_verifications(
        &self,
        invoice_id: Uuid,
        limit: i64,
    ) -> Result<Vec<VerificationLog>, AppError>;
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;
}

/// Everything the service needs from storage.
pub trait TrustStore:
    TenantStore + InvoiceStore + ReminderStore + QuotaStore + VerificationLogStore + HealthCheck
{
}

impl<T> TrustStore for T where
    T: TenantStore + InvoiceStore + ReminderStore + QuotaStore + VerificationLogStore + HealthCheck
{
}
