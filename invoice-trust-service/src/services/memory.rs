//! In-process store used for local runs and tests.
//!
//! A single mutex guards all state, so every trait method is atomic with
//! respect to the others, matching the per-statement guarantees of the
//! Postgres implementation.

use crate::models::{
    ClaimScope, CounterKind, DeliveryStatus, DispatchOutcome, Invoice, NewReminder,
    NewVerificationLog, PaymentStatus, QuotaCounter, Reminder, ReminderStatus, Tenant,
    VerificationLog,
};
use crate::services::store::{
    HealthCheck, InvoiceStore, QuotaStore, ReminderStore, TenantStore, VerificationLogStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use service_core::error::AppError;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct State {
    tenants: HashMap<Uuid, Tenant>,
    members: HashMap<Uuid, HashSet<Uuid>>,
    invoices: HashMap<Uuid, Invoice>,
    reminders: HashMap<Uuid, Reminder>,
    counters: HashMap<Uuid, QuotaCounter>,
    verification_logs: Vec<VerificationLog>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    fail_verification_logs: AtomicBool,
    unavailable: AtomicBool,
}

fn lease_free(reminder: &Reminder, now: DateTime<Utc>) -> bool {
    reminder.claimed_until.map_or(true, |until| until <= now)
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, AppError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "In-memory store marked unavailable"
            )));
        }
        self.state
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("Store mutex poisoned: {}", e)))
    }

    pub fn insert_tenant(&self, tenant: Tenant) -> Result<(), AppError> {
        let mut state = self.lock()?;
        state
            .members
            .entry(tenant.tenant_id)
            .or_default();
        state.tenants.insert(tenant.tenant_id, tenant);
        Ok(())
    }

    pub fn add_team_member(&self, tenant_id: Uuid, user_id: Uuid) -> Result<(), AppError> {
        self.lock()?
            .members
            .entry(tenant_id)
            .or_default()
            .insert(user_id);
        Ok(())
    }

    /// Overwrite a tenant's quota counter.
    pub fn put_counter(&self, counter: QuotaCounter) -> Result<(), AppError> {
        self.lock()?.counters.insert(counter.tenant_id, counter);
        Ok(())
    }

    /// Edit a stored invoice in place, bypassing the service layer.
    pub fn modify_invoice<F>(&self, invoice_id: Uuid, f: F) -> Result<bool, AppError>
    where
        F: FnOnce(&mut Invoice),
    {
        let mut state = self.lock()?;
        match state.invoices.get_mut(&invoice_id) {
            Some(invoice) => {
                f(invoice);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Edit a stored reminder in place, bypassing the service layer.
    pub fn modify_reminder<F>(&self, reminder_id: Uuid, f: F) -> Result<bool, AppError>
    where
        F: FnOnce(&mut Reminder),
    {
        let mut state = self.lock()?;
        match state.reminders.get_mut(&reminder_id) {
            Some(reminder) => {
                f(reminder);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Make verification audit writes fail.
    pub fn fail_verification_logs(&self, fail: bool) {
        self.fail_verification_logs.store(fail, Ordering::SeqCst);
    }

    /// Make every storage call fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn verification_log_count(&self) -> Result<usize, AppError> {
        Ok(self.lock()?.verification_logs.len())
    }
}

#[async_trait]
impl TenantStore for InMemoryStore {
    async fn get_tenant(&self, tenant_id: Uuid) -> Result<Option<Tenant>, AppError> {
        Ok(self.lock()?.tenants.get(&tenant_id).cloned())
    }

    async fn count_team_members(&self, tenant_id: Uuid) -> Result<i64, AppError> {
        Ok(self
            .lock()?
            .members
            .get(&tenant_id)
            .map_or(0, |m| m.len() as i64))
    }
}

#[async_trait]
impl InvoiceStore for InMemoryStore {
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), AppError> {
        let mut state = self.lock()?;
        let duplicate = state.invoices.values().any(|existing| {
            existing.verification_code == invoice.verification_code
                || (existing.tenant_id == invoice.tenant_id
                    && existing.invoice_number == invoice.invoice_number)
        });
        if duplicate || state.invoices.contains_key(&invoice.invoice_id) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Invoice number already exists"
            )));
        }
        state.invoices.insert(invoice.invoice_id, invoice.clone());
        Ok(())
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        Ok(self.lock()?.invoices.get(&invoice_id).cloned())
    }

    async fn get_invoice_by_code(&self, code: &str) -> Result<Option<Invoice>, AppError> {
        Ok(self
            .lock()?
            .invoices
            .values()
            .find(|i| i.verification_code == code)
            .cloned())
    }

    async fn update_invoice_status(
        &self,
        invoice_id: Uuid,
        payment_status: Option<PaymentStatus>,
        delivery_status: Option<DeliveryStatus>,
    ) -> Result<Option<Invoice>, AppError> {
        let mut state = self.lock()?;
        Ok(state.invoices.get_mut(&invoice_id).map(|invoice| {
            if let Some(status) = payment_status {
                invoice.payment_status = status;
            }
            if let Some(status) = delivery_status {
                invoice.delivery_status = status;
            }
            invoice.updated_utc = Utc::now();
            invoice.clone()
        }))
    }

    async fn update_due_date(
        &self,
        invoice_id: Uuid,
        due_date: NaiveDate,
    ) -> Result<Option<Invoice>, AppError> {
        let mut state = self.lock()?;
        Ok(state.invoices.get_mut(&invoice_id).map(|invoice| {
            invoice.due_date = Some(due_date);
            invoice.updated_utc = Utc::now();
            invoice.clone()
        }))
    }
}

fn build_reminder(input: &NewReminder, now: DateTime<Utc>) -> Reminder {
    Reminder {
        reminder_id: Uuid::new_v4(),
        tenant_id: input.tenant_id,
        invoice_id: input.invoice_id,
        reminder_type: input.reminder_type,
        days_offset: input.days_offset,
        channel: input.channel,
        scheduled_for: input.scheduled_for,
        status: ReminderStatus::Pending,
        claimed_until: None,
        delivery_attempted_at: None,
        sent_at: None,
        provider_message_id: None,
        error_message: None,
        created_utc: now,
        updated_utc: now,
    }
}

impl State {
    fn slot_taken(&self, input: &NewReminder) -> bool {
        self.reminders
            .values()
            .any(|r| r.status.holds_slot() && r.slot() == input.slot())
    }

    fn reminders_of(&self, invoice_id: Uuid, status: Option<ReminderStatus>) -> Vec<Reminder> {
        let mut reminders: Vec<Reminder> = self
            .reminders
            .values()
            .filter(|r| r.invoice_id == invoice_id && status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        reminders.sort_by_key(|r| (r.scheduled_for, r.created_utc));
        reminders
    }
}

#[async_trait]
impl ReminderStore for InMemoryStore {
    async fn replace_default_set(
        &self,
        invoice_id: Uuid,
        reminders: &[NewReminder],
    ) -> Result<Vec<Reminder>, AppError> {
        let now = Utc::now();
        let mut state = self.lock()?;

        state.reminders.retain(|_, r| {
            !(r.invoice_id == invoice_id
                && matches!(r.status, ReminderStatus::Cancelled | ReminderStatus::Skipped))
        });

        for input in reminders {
            if !state.slot_taken(input) {
                let reminder = build_reminder(input, now);
                state.reminders.insert(reminder.reminder_id, reminder);
            }
        }

        Ok(state.reminders_of(invoice_id, Some(ReminderStatus::Pending)))
    }

    async fn insert_reminder(&self, input: &NewReminder) -> Result<Reminder, AppError> {
        let mut state = self.lock()?;
        if state.slot_taken(input) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "A reminder already exists for this slot"
            )));
        }
        let reminder = build_reminder(input, Utc::now());
        state
            .reminders
            .insert(reminder.reminder_id, reminder.clone());
        Ok(reminder)
    }

    async fn get_reminder(&self, reminder_id: Uuid) -> Result<Option<Reminder>, AppError> {
        Ok(self.lock()?.reminders.get(&reminder_id).cloned())
    }

    async fn list_reminders(&self, invoice_id: Uuid) -> Result<Vec<Reminder>, AppError> {
        Ok(self.lock()?.reminders_of(invoice_id, None))
    }

    async fn cancel_reminder(&self, reminder_id: Uuid) -> Result<bool, AppError> {
        let now = Utc::now();
        let mut state = self.lock()?;
        match state.reminders.get_mut(&reminder_id) {
            Some(r) if r.status == ReminderStatus::Pending && lease_free(r, now) => {
                r.status = ReminderStatus::Cancelled;
                r.updated_utc = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_pending_for_invoice(
        &self,
        invoice_id: Uuid,
        only_relative: bool,
    ) -> Result<u64, AppError> {
        let now = Utc::now();
        let mut state = self.lock()?;
        let mut cancelled = 0;
        for r in state.reminders.values_mut() {
            if r.invoice_id == invoice_id
                && r.status == ReminderStatus::Pending
                && lease_free(r, now)
                && (!only_relative || r.reminder_type.is_relative())
            {
                r.status = ReminderStatus::Cancelled;
                r.updated_utc = now;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn list_due_reminders(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Reminder>, AppError> {
        let state = self.lock()?;
        let mut due: Vec<Reminder> = state
            .reminders
            .values()
            .filter(|r| {
                r.status == ReminderStatus::Pending
                    && r.scheduled_for <= before
                    && r.delivery_attempted_at.is_none()
                    && lease_free(r, before)
            })
            .cloned()
            .collect();
        due.sort_by_key(|r| r.scheduled_for);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn claim_reminder(
        &self,
        reminder_id: Uuid,
        scope: ClaimScope,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Reminder>, AppError> {
        let mut state = self.lock()?;
        let Some(r) = state.reminders.get_mut(&reminder_id) else {
            return Ok(None);
        };

        let eligible = match scope {
            ClaimScope::Due => {
                r.status == ReminderStatus::Pending
                    && r.scheduled_for <= now
                    && r.delivery_attempted_at.is_none()
            }
            ClaimScope::Manual => {
                matches!(r.status, ReminderStatus::Pending | ReminderStatus::Failed)
            }
        };
        if !eligible || !lease_free(r, now) {
            return Ok(None);
        }

        r.claimed_until = Some(now + lease);
        r.updated_utc = now;
        Ok(Some(r.clone()))
    }

    async fn mark_delivery_attempt(
        &self,
        reminder_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut state = self.lock()?;
        match state.reminders.get_mut(&reminder_id) {
            Some(r) if r.claimed_until.is_some_and(|until| until > now) => {
                r.delivery_attempted_at = Some(now);
                r.updated_utc = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_reminder(
        &self,
        reminder_id: Uuid,
        outcome: &DispatchOutcome,
        now: DateTime<Utc>,
    ) -> Result<Option<Reminder>, AppError> {
        let mut state = self.lock()?;
        let Some(r) = state.reminders.get_mut(&reminder_id) else {
            return Ok(None);
        };
        if r.claimed_until.is_none() {
            return Ok(None);
        }

        r.status = outcome.status();
        r.claimed_until = None;
        r.updated_utc = now;
        match outcome {
            DispatchOutcome::Sent {
                provider_message_id,
            } => {
                r.sent_at = Some(now);
                r.provider_message_id = provider_message_id.clone();
                r.error_message = None;
            }
            DispatchOutcome::Failed { error } => {
                r.error_message = Some(error.clone());
            }
            DispatchOutcome::Skipped { reason } => {
                r.error_message = Some(reason.clone());
            }
        }
        Ok(Some(r.clone()))
    }
}

#[async_trait]
impl QuotaStore for InMemoryStore {
    async fn load_counter(
        &self,
        tenant_id: Uuid,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<QuotaCounter, AppError> {
        let mut state = self.lock()?;
        let counter = state
            .counters
            .entry(tenant_id)
            .or_insert_with(|| QuotaCounter::new(tenant_id, now));
        if counter.window_elapsed(now, window) {
            counter.reset(now);
        }
        Ok(counter.clone())
    }

    async fn try_increment(
        &self,
        tenant_id: Uuid,
        kind: CounterKind,
        amount: i64,
        limit: Option<i64>,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<Option<QuotaCounter>, AppError> {
        let mut state = self.lock()?;
        let counter = state
            .counters
            .entry(tenant_id)
            .or_insert_with(|| QuotaCounter::new(tenant_id, now));
        if counter.window_elapsed(now, window) {
            counter.reset(now);
        }
        if let Some(max) = limit {
            if counter.get(kind).saturating_add(amount) > max {
                return Ok(None);
            }
        }
        counter.add(kind, amount);
        Ok(Some(counter.clone()))
    }
}

#[async_trait]
impl VerificationLogStore for InMemoryStore {
    async fn record_verification(&self, entry: &NewVerificationLog) -> Result<(), AppError> {
        if self.fail_verification_logs.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "Verification log unavailable"
            )));
        }
        self.lock()?.verification_logs.push(VerificationLog {
            log_id: Uuid::new_v4(),
            verification_code: entry.verification_code.clone(),
            invoice_id: entry.invoice_id,
            status: entry.status,
            ip_address: entry.ip_address.clone(),
            user_agent: entry.user_agent.clone(),
            verified_at: entry.verified_at,
        });
        Ok(())
    }

    async fn list_verifications(
        &self,
        invoice_id: Uuid,
        limit: i64,
    ) -> Result<Vec<VerificationLog>, AppError> {
        let state = self.lock()?;
        let mut logs: Vec<VerificationLog> = state
            .verification_logs
            .iter()
            .filter(|l| l.invoice_id == Some(invoice_id))
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.verified_at.cmp(&a.verified_at));
        logs.truncate(limit.max(0) as usize);
        Ok(logs)
    }
}

#[async_trait]
impl HealthCheck for InMemoryStore {
    async fn health_check(&self) -> Result<(), AppError> {
        self.lock().map(|_| ())
    }
}
