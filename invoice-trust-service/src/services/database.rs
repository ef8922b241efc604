//! Database service for invoice-trust-service.

use crate::models::{
    BuyerSnapshot, ClaimScope, CounterKind, DeliveryStatus, DispatchOutcome, Invoice, LineItem,
    NewReminder, NewVerificationLog, PaymentStatus, PlanTier, QuotaCounter, Reminder, Tenant,
    TenantSettings, VerificationLog,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{
    HealthCheck, InvoiceStore, QuotaStore, ReminderStore, TenantStore, VerificationLogStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::str::FromStr;
use tracing::{info, instrument};
use uuid::Uuid;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

const INVOICE_COLUMNS: &str = "invoice_id, tenant_id, invoice_number, issuer_name, buyer_name, \
     buyer_email, buyer_phone, buyer_address, buyer_tax_id, currency, issue_date, due_date, \
     subtotal, tax_total, total, payment_status, delivery_status, template_id, \
     verification_code, sealed_hash, created_utc, updated_utc";

const REMINDER_COLUMNS: &str = "reminder_id, tenant_id, invoice_id, reminder_type, days_offset, \
     channel, scheduled_for, status, claimed_until, delivery_attempted_at, sent_at, \
     provider_message_id, error_message, created_utc, updated_utc";

const COUNTER_COLUMNS: &str =
    "tenant_id, invoices_count, pdf_api_usage, ocr_usage, last_reset_date";

fn parse_column<T>(value: &str, column: &str) -> Result<T, AppError>
where
    T: FromStr<Err = String>,
{
    value.parse().map_err(|e: String| {
        AppError::DatabaseError(anyhow::anyhow!("Invalid {} value: {}", column, e))
    })
}

#[derive(FromRow)]
struct TenantRow {
    tenant_id: Uuid,
    name: String,
    plan: String,
    settings: Json<TenantSettings>,
    created_utc: DateTime<Utc>,
}

impl TryFrom<TenantRow> for Tenant {
    type Error = AppError;

    fn try_from(row: TenantRow) -> Result<Self, Self::Error> {
        Ok(Tenant {
            tenant_id: row.tenant_id,
            name: row.name,
            plan: parse_column::<PlanTier>(&row.plan, "plan")?,
            settings: row.settings.0,
            created_utc: row.created_utc,
        })
    }
}

#[derive(FromRow)]
struct InvoiceRow {
    invoice_id: Uuid,
    tenant_id: Uuid,
    invoice_number: String,
    issuer_name: String,
    buyer_name: String,
    buyer_email: Option<String>,
    buyer_phone: Option<String>,
    buyer_address: Option<String>,
    buyer_tax_id: Option<String>,
    currency: String,
    issue_date: NaiveDate,
    due_date: Option<NaiveDate>,
    subtotal: Decimal,
    tax_total: Decimal,
    total: Decimal,
    payment_status: String,
    delivery_status: String,
    template_id: String,
    verification_code: String,
    sealed_hash: String,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl InvoiceRow {
    fn into_invoice(self, line_items: Vec<LineItem>) -> Result<Invoice, AppError> {
        Ok(Invoice {
            invoice_id: self.invoice_id,
            tenant_id: self.tenant_id,
            invoice_number: self.invoice_number,
            issuer_name: self.issuer_name,
            buyer: BuyerSnapshot {
                name: self.buyer_name,
                email: self.buyer_email,
                phone: self.buyer_phone,
                address: self.buyer_address,
                tax_id: self.buyer_tax_id,
            },
            currency: self.currency,
            issue_date: self.issue_date,
            due_date: self.due_date,
            line_items,
            subtotal: self.subtotal,
            tax_total: self.tax_total,
            total: self.total,
            payment_status: parse_column::<PaymentStatus>(&self.payment_status, "payment_status")?,
            delivery_status: parse_column::<DeliveryStatus>(
                &self.delivery_status,
                "delivery_status",
            )?,
            template_id: self.template_id,
            verification_code: self.verification_code,
            sealed_hash: self.sealed_hash,
            created_utc: self.created_utc,
            updated_utc: self.updated_utc,
        })
    }
}

#[derive(FromRow)]
struct LineItemRow {
    position: i32,
    description: String,
    quantity: Decimal,
    unit_price: Decimal,
    tax_rate: Decimal,
    total: Decimal,
}

impl From<LineItemRow> for LineItem {
    fn from(row: LineItemRow) -> Self {
        LineItem {
            position: row.position,
            description: row.description,
            quantity: row.quantity,
            unit_price: row.unit_price,
            tax_rate: row.tax_rate,
            total: row.total,
        }
    }
}

#[derive(FromRow)]
struct ReminderRow {
    reminder_id: Uuid,
    tenant_id: Uuid,
    invoice_id: Uuid,
    reminder_type: String,
    days_offset: i32,
    channel: String,
    scheduled_for: DateTime<Utc>,
    status: String,
    claimed_until: Option<DateTime<Utc>>,
    delivery_attempted_at: Option<DateTime<Utc>>,
    sent_at: Option<DateTime<Utc>>,
    provider_message_id: Option<String>,
    error_message: Option<String>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl TryFrom<ReminderRow> for Reminder {
    type Error = AppError;

    fn try_from(row: ReminderRow) -> Result<Self, Self::Error> {
        Ok(Reminder {
            reminder_id: row.reminder_id,
            tenant_id: row.tenant_id,
            invoice_id: row.invoice_id,
            reminder_type: parse_column(&row.reminder_type, "reminder_type")?,
            days_offset: row.days_offset,
            channel: parse_column(&row.channel, "channel")?,
            scheduled_for: row.scheduled_for,
            status: parse_column(&row.status, "status")?,
            claimed_until: row.claimed_until,
            delivery_attempted_at: row.delivery_attempted_at,
            sent_at: row.sent_at,
            provider_message_id: row.provider_message_id,
            error_message: row.error_message,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        })
    }
}

fn reminders_from_rows(rows: Vec<ReminderRow>) -> Result<Vec<Reminder>, AppError> {
    rows.into_iter().map(Reminder::try_from).collect()
}

#[derive(FromRow)]
struct CounterRow {
    tenant_id: Uuid,
    invoices_count: i64,
    pdf_api_usage: i64,
    ocr_usage: i64,
    last_reset_date: DateTime<Utc>,
}

impl From<CounterRow> for QuotaCounter {
    fn from(row: CounterRow) -> Self {
        QuotaCounter {
            tenant_id: row.tenant_id,
            invoices_count: row.invoices_count,
            pdf_api_usage: row.pdf_api_usage,
            ocr_usage: row.ocr_usage,
            last_reset_date: row.last_reset_date,
        }
    }
}

#[derive(FromRow)]
struct VerificationLogRow {
    log_id: Uuid,
    verification_code: String,
    invoice_id: Option<Uuid>,
    status: String,
    ip_address: Option<String>,
    user_agent: Option<String>,
    verified_at: DateTime<Utc>,
}

impl TryFrom<VerificationLogRow> for VerificationLog {
    type Error = AppError;

    fn try_from(row: VerificationLogRow) -> Result<Self, Self::Error> {
        Ok(VerificationLog {
            log_id: row.log_id,
            verification_code: row.verification_code,
            invoice_id: row.invoice_id,
            status: parse_column(&row.status, "status")?,
            ip_address: row.ip_address,
            user_agent: row.user_agent,
            verified_at: row.verified_at,
        })
    }
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "invoice-trust-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .idle_timeout(std::time::Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn fetch_line_items(&self, invoice_id: Uuid) -> Result<Vec<LineItem>, AppError> {
        let rows = sqlx::query_as::<_, LineItemRow>(
            r#"
            SELECT position, description, quantity, unit_price, tax_rate, total
            FROM invoice_line_items
            WHERE invoice_id = $1
            ORDER BY position
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get line items: {}", e))
        })?;

        Ok(rows.into_iter().map(LineItem::from).collect())
    }

    async fn hydrate_invoice(&self, row: Option<InvoiceRow>) -> Result<Option<Invoice>, AppError> {
        match row {
            Some(row) => {
                let items = self.fetch_line_items(row.invoice_id).await?;
                Ok(Some(row.into_invoice(items)?))
            }
            None => Ok(None),
        }
    }

    async fn ensure_counter(&self, tenant_id: Uuid, now: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO quota_counters (tenant_id, last_reset_date)
            VALUES ($1, $2)
            ON CONFLICT (tenant_id) DO NOTHING
            "#,
        )
        .bind(tenant_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to create quota counter: {}", e))
        })?;
        Ok(())
    }
}

#[async_trait]
impl HealthCheck for Database {
    /// Check database health.
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }
}

// =========================================================================
// Tenant Operations
// =========================================================================

#[async_trait]
impl TenantStore for Database {
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn get_tenant(&self, tenant_id: Uuid) -> Result<Option<Tenant>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_tenant"])
            .start_timer();

        let row = sqlx::query_as::<_, TenantRow>(
            r#"
            SELECT tenant_id, name, plan, settings, created_utc
            FROM tenants
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get tenant: {}", e)))?;

        timer.observe_duration();
        row.map(Tenant::try_from).transpose()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn count_team_members(&self, tenant_id: Uuid) -> Result<i64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["count_team_members"])
            .start_timer();

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM tenant_members WHERE tenant_id = $1")
                .bind(tenant_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!(
                        "Failed to count team members: {}",
                        e
                    ))
                })?;

        timer.observe_duration();
        Ok(count)
    }
}

// =========================================================================
// Invoice Operations
// =========================================================================

#[async_trait]
impl InvoiceStore for Database {
    #[instrument(skip(self, invoice), fields(tenant_id = %invoice.tenant_id, invoice_id = %invoice.invoice_id))]
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_invoice"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        sqlx::query(
            r#"
            INSERT INTO invoices (invoice_id, tenant_id, invoice_number, issuer_name, buyer_name, buyer_email, buyer_phone, buyer_address, buyer_tax_id, currency, issue_date, due_date, subtotal, tax_total, total, payment_status, delivery_status, template_id, verification_code, sealed_hash, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)
            "#,
        )
        .bind(invoice.invoice_id)
        .bind(invoice.tenant_id)
        .bind(&invoice.invoice_number)
        .bind(&invoice.issuer_name)
        .bind(&invoice.buyer.name)
        .bind(&invoice.buyer.email)
        .bind(&invoice.buyer.phone)
        .bind(&invoice.buyer.address)
        .bind(&invoice.buyer.tax_id)
        .bind(&invoice.currency)
        .bind(invoice.issue_date)
        .bind(invoice.due_date)
        .bind(invoice.subtotal)
        .bind(invoice.tax_total)
        .bind(invoice.total)
        .bind(invoice.payment_status.as_str())
        .bind(invoice.delivery_status.as_str())
        .bind(&invoice.template_id)
        .bind(&invoice.verification_code)
        .bind(&invoice.sealed_hash)
        .bind(invoice.created_utc)
        .bind(invoice.updated_utc)
        .execute(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!("Invoice number already exists"))
            }
            _ => AppError::DatabaseError(anyhow::anyhow!("Failed to insert invoice: {}", e)),
        })?;

        for item in &invoice.line_items {
            sqlx::query(
                r#"
                INSERT INTO invoice_line_items (invoice_id, position, description, quantity, unit_price, tax_rate, total)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(invoice.invoice_id)
            .bind(item.position)
            .bind(&item.description)
            .bind(item.quantity)
            .bind(item.unit_price)
            .bind(item.tax_rate)
            .bind(item.total)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to insert line item: {}", e))
            })?;
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit invoice: {}", e))
        })?;

        timer.observe_duration();
        info!(invoice_number = %invoice.invoice_number, "Invoice stored");
        Ok(())
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let row = sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {} FROM invoices WHERE invoice_id = $1",
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get invoice: {}", e)))?;

        let invoice = self.hydrate_invoice(row).await?;
        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self, code))]
    async fn get_invoice_by_code(&self, code: &str) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice_by_code"])
            .start_timer();

        let row = sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {} FROM invoices WHERE verification_code = $1",
            INVOICE_COLUMNS
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get invoice by code: {}", e))
        })?;

        let invoice = self.hydrate_invoice(row).await?;
        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn update_invoice_status(
        &self,
        invoice_id: Uuid,
        payment_status: Option<PaymentStatus>,
        delivery_status: Option<DeliveryStatus>,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_invoice_status"])
            .start_timer();

        let row = sqlx::query_as::<_, InvoiceRow>(&format!(
            r#"
            UPDATE invoices
            SET payment_status = COALESCE($2, payment_status),
                delivery_status = COALESCE($3, delivery_status),
                updated_utc = NOW()
            WHERE invoice_id = $1
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .bind(payment_status.map(|s| s.as_str()))
        .bind(delivery_status.map(|s| s.as_str()))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update invoice status: {}", e))
        })?;

        let invoice = self.hydrate_invoice(row).await?;
        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn update_due_date(
        &self,
        invoice_id: Uuid,
        due_date: NaiveDate,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_due_date"])
            .start_timer();

        let row = sqlx::query_as::<_, InvoiceRow>(&format!(
            r#"
            UPDATE invoices
            SET due_date = $2, updated_utc = NOW()
            WHERE invoice_id = $1
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .bind(due_date)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update due date: {}", e))
        })?;

        let invoice = self.hydrate_invoice(row).await?;
        timer.observe_duration();
        Ok(invoice)
    }
}

// =========================================================================
// Reminder Operations
// =========================================================================

#[async_trait]
impl ReminderStore for Database {
    #[instrument(skip(self, reminders), fields(invoice_id = %invoice_id, count = reminders.len()))]
    async fn replace_default_set(
        &self,
        invoice_id: Uuid,
        reminders: &[NewReminder],
    ) -> Result<Vec<Reminder>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["replace_default_set"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        sqlx::query(
            r#"
            DELETE FROM reminders
            WHERE invoice_id = $1 AND status IN ('cancelled', 'skipped')
            "#,
        )
        .bind(invoice_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to delete stale reminders: {}", e))
        })?;

        for reminder in reminders {
            sqlx::query(
                r#"
                INSERT INTO reminders (reminder_id, tenant_id, invoice_id, reminder_type, days_offset, channel, scheduled_for)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (invoice_id, reminder_type, days_offset, channel, scheduled_for)
                    WHERE status IN ('pending', 'sent', 'failed')
                DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(reminder.tenant_id)
            .bind(reminder.invoice_id)
            .bind(reminder.reminder_type.as_str())
            .bind(reminder.days_offset)
            .bind(reminder.channel.as_str())
            .bind(reminder.scheduled_for)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to insert reminder: {}", e))
            })?;
        }

        let rows = sqlx::query_as::<_, ReminderRow>(&format!(
            r#"
            SELECT {}
            FROM reminders
            WHERE invoice_id = $1 AND status = 'pending'
            ORDER BY scheduled_for, created_utc
            "#,
            REMINDER_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list reminders: {}", e))
        })?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit reminder set: {}", e))
        })?;

        timer.observe_duration();
        reminders_from_rows(rows)
    }

    #[instrument(skip(self, reminder), fields(invoice_id = %reminder.invoice_id))]
    async fn insert_reminder(&self, reminder: &NewReminder) -> Result<Reminder, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_reminder"])
            .start_timer();

        let row = sqlx::query_as::<_, ReminderRow>(&format!(
            r#"
            INSERT INTO reminders (reminder_id, tenant_id, invoice_id, reminder_type, days_offset, channel, scheduled_for)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {}
            "#,
            REMINDER_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(reminder.tenant_id)
        .bind(reminder.invoice_id)
        .bind(reminder.reminder_type.as_str())
        .bind(reminder.days_offset)
        .bind(reminder.channel.as_str())
        .bind(reminder.scheduled_for)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!("A reminder already exists for this slot"))
            }
            _ => AppError::DatabaseError(anyhow::anyhow!("Failed to insert reminder: {}", e)),
        })?;

        timer.observe_duration();
        Reminder::try_from(row)
    }

    #[instrument(skip(self), fields(reminder_id = %reminder_id))]
    async fn get_reminder(&self, reminder_id: Uuid) -> Result<Option<Reminder>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_reminder"])
            .start_timer();

        let row = sqlx::query_as::<_, ReminderRow>(&format!(
            "SELECT {} FROM reminders WHERE reminder_id = $1",
            REMINDER_COLUMNS
        ))
        .bind(reminder_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get reminder: {}", e)))?;

        timer.observe_duration();
        row.map(Reminder::try_from).transpose()
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn list_reminders(&self, invoice_id: Uuid) -> Result<Vec<Reminder>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_reminders"])
            .start_timer();

        let rows = sqlx::query_as::<_, ReminderRow>(&format!(
            r#"
            SELECT {}
            FROM reminders
            WHERE invoice_id = $1
            ORDER BY scheduled_for, created_utc
            "#,
            REMINDER_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list reminders: {}", e))
        })?;

        timer.observe_duration();
        reminders_from_rows(rows)
    }

    #[instrument(skip(self), fields(reminder_id = %reminder_id))]
    async fn cancel_reminder(&self, reminder_id: Uuid) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["cancel_reminder"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE reminders
            SET status = 'cancelled', updated_utc = NOW()
            WHERE reminder_id = $1
              AND status = 'pending'
              AND (claimed_until IS NULL OR claimed_until <= NOW())
            "#,
        )
        .bind(reminder_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to cancel reminder: {}", e))
        })?;

        timer.observe_duration();
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn cancel_pending_for_invoice(
        &self,
        invoice_id: Uuid,
        only_relative: bool,
    ) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["cancel_pending_for_invoice"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE reminders
            SET status = 'cancelled', updated_utc = NOW()
            WHERE invoice_id = $1
              AND status = 'pending'
              AND (claimed_until IS NULL OR claimed_until <= NOW())
              AND (NOT $2 OR reminder_type <> 'custom')
            "#,
        )
        .bind(invoice_id)
        .bind(only_relative)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to cancel reminders: {}", e))
        })?;

        timer.observe_duration();
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn list_due_reminders(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Reminder>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_due_reminders"])
            .start_timer();

        let rows = sqlx::query_as::<_, ReminderRow>(&format!(
            r#"
            SELECT {}
            FROM reminders
            WHERE status = 'pending'
              AND scheduled_for <= $1
              AND delivery_attempted_at IS NULL
              AND (claimed_until IS NULL OR claimed_until <= $1)
            ORDER BY scheduled_for
            LIMIT $2
            "#,
            REMINDER_COLUMNS
        ))
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list due reminders: {}", e))
        })?;

        timer.observe_duration();
        reminders_from_rows(rows)
    }

    #[instrument(skip(self, lease), fields(reminder_id = %reminder_id, scope = ?scope))]
    async fn claim_reminder(
        &self,
        reminder_id: Uuid,
        scope: ClaimScope,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Reminder>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["claim_reminder"])
            .start_timer();

        let row = sqlx::query_as::<_, ReminderRow>(&format!(
            r#"
            UPDATE reminders
            SET claimed_until = $3, updated_utc = $2
            WHERE reminder_id = $1
              AND (claimed_until IS NULL OR claimed_until <= $2)
              AND (
                (status = 'pending' AND scheduled_for <= $2 AND delivery_attempted_at IS NULL)
                OR ($4 AND status IN ('pending', 'failed'))
              )
            RETURNING {}
            "#,
            REMINDER_COLUMNS
        ))
        .bind(reminder_id)
        .bind(now)
        .bind(now + lease)
        .bind(scope == ClaimScope::Manual)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to claim reminder: {}", e))
        })?;

        timer.observe_duration();
        row.map(Reminder::try_from).transpose()
    }

    #[instrument(skip(self), fields(reminder_id = %reminder_id))]
    async fn mark_delivery_attempt(
        &self,
        reminder_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_delivery_attempt"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE reminders
            SET delivery_attempted_at = $2, updated_utc = $2
            WHERE reminder_id = $1 AND claimed_until > $2
            "#,
        )
        .bind(reminder_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to mark delivery attempt: {}", e))
        })?;

        timer.observe_duration();
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, outcome), fields(reminder_id = %reminder_id, status = %outcome.status().as_str()))]
    async fn complete_reminder(
        &self,
        reminder_id: Uuid,
        outcome: &DispatchOutcome,
        now: DateTime<Utc>,
    ) -> Result<Option<Reminder>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["complete_reminder"])
            .start_timer();

        let (sent_at, provider_message_id, error_message) = match outcome {
            DispatchOutcome::Sent {
                provider_message_id,
            } => (Some(now), provider_message_id.clone(), None),
            DispatchOutcome::Failed { error } => (None, None, Some(error.clone())),
            DispatchOutcome::Skipped { reason } => (None, None, Some(reason.clone())),
        };

        let row = sqlx::query_as::<_, ReminderRow>(&format!(
            r#"
            UPDATE reminders
            SET status = $2,
                sent_at = COALESCE($3, sent_at),
                provider_message_id = COALESCE($4, provider_message_id),
                error_message = $5,
                claimed_until = NULL,
                updated_utc = $6
            WHERE reminder_id = $1 AND claimed_until IS NOT NULL
            RETURNING {}
            "#,
            REMINDER_COLUMNS
        ))
        .bind(reminder_id)
        .bind(outcome.status().as_str())
        .bind(sent_at)
        .bind(provider_message_id)
        .bind(error_message)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to complete reminder: {}", e))
        })?;

        timer.observe_duration();
        row.map(Reminder::try_from).transpose()
    }
}

// =========================================================================
// Quota Operations
// =========================================================================

#[async_trait]
impl QuotaStore for Database {
    #[instrument(skip(self, window), fields(tenant_id = %tenant_id))]
    async fn load_counter(
        &self,
        tenant_id: Uuid,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<QuotaCounter, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["load_counter"])
            .start_timer();

        self.ensure_counter(tenant_id, now).await?;

        // Reset is a conditional update so concurrent readers reset once.
        sqlx::query(
            r#"
            UPDATE quota_counters
            SET invoices_count = 0, pdf_api_usage = 0, ocr_usage = 0,
                last_reset_date = $2, updated_utc = $2
            WHERE tenant_id = $1 AND last_reset_date < $3
            "#,
        )
        .bind(tenant_id)
        .bind(now)
        .bind(now - window)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to reset quota counter: {}", e))
        })?;

        let row = sqlx::query_as::<_, CounterRow>(&format!(
            "SELECT {} FROM quota_counters WHERE tenant_id = $1",
            COUNTER_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to load quota counter: {}", e))
        })?;

        timer.observe_duration();
        Ok(row.into())
    }

    #[instrument(skip(self, window), fields(tenant_id = %tenant_id, kind = ?kind, amount = amount))]
    async fn try_increment(
        &self,
        tenant_id: Uuid,
        kind: CounterKind,
        amount: i64,
        limit: Option<i64>,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<Option<QuotaCounter>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["try_increment"])
            .start_timer();

        self.ensure_counter(tenant_id, now).await?;

        let target = kind.column();
        let assignments = [
            CounterKind::Invoices,
            CounterKind::PdfApi,
            CounterKind::Ocr,
        ]
        .iter()
        .map(|k| {
            let column = k.column();
            if column == target {
                format!(
                    "{col} = (CASE WHEN last_reset_date < $3 THEN 0 ELSE {col} END) + $4",
                    col = column
                )
            } else {
                format!(
                    "{col} = CASE WHEN last_reset_date < $3 THEN 0 ELSE {col} END",
                    col = column
                )
            }
        })
        .collect::<Vec<_>>()
        .join(", ");

        let sql = format!(
            r#"
            UPDATE quota_counters
            SET {assignments},
                last_reset_date = CASE WHEN last_reset_date < $3 THEN $2 ELSE last_reset_date END,
                updated_utc = $2
            WHERE tenant_id = $1
              AND ($5::BIGINT IS NULL
                   OR (CASE WHEN last_reset_date < $3 THEN 0 ELSE {target} END) + $4 <= $5)
            RETURNING {columns}
            "#,
            assignments = assignments,
            target = target,
            columns = COUNTER_COLUMNS
        );

        let row = sqlx::query_as::<_, CounterRow>(&sql)
            .bind(tenant_id)
            .bind(now)
            .bind(now - window)
            .bind(amount)
            .bind(limit)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to increment quota: {}", e))
            })?;

        timer.observe_duration();
        Ok(row.map(QuotaCounter::from))
    }
}

// =========================================================================
// Verification Log Operations
// =========================================================================

#[async_trait]
impl VerificationLogStore for Database {
    #[instrument(skip(self, entry), fields(status = %entry.status.as_str()))]
    async fn record_verification(&self, entry: &NewVerificationLog) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_verification"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO verification_logs (log_id, verification_code, invoice_id, status, ip_address, user_agent, verified_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&entry.verification_code)
        .bind(entry.invoice_id)
        .bind(entry.status.as_str())
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .bind(entry.verified_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to record verification: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn list_verifications(
        &self,
        invoice_id: Uuid,
        limit: i64,
    ) -> Result<Vec<VerificationLog>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_verifications"])
            .start_timer();

        let rows = sqlx::query_as::<_, VerificationLogRow>(
            r#"
            SELECT log_id, verification_code, invoice_id, status, ip_address, user_agent, verified_at
            FROM verification_logs
            WHERE invoice_id = $1
            ORDER BY verified_at DESC
            LIMIT $2
            "#,
        )
        .bind(invoice_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list verifications: {}", e))
        })?;

        timer.observe_duration();
        rows.into_iter().map(VerificationLog::try_from).collect()
    }
}
