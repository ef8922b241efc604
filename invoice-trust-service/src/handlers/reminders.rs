//! Reminder endpoints.

use crate::middleware::TenantContext;
use crate::models::{CreateReminderRequest, Reminder};
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use service_core::error::AppError;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct CancelledResponse {
    pub cancelled: u64,
}

/// `GET /invoices/:invoice_id/reminders`
pub async fn list_reminders(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<Vec<Reminder>>, AppError> {
    Ok(Json(state.scheduler.list(tenant.tenant_id, invoice_id).await?))
}

/// `POST /invoices/:invoice_id/reminders/default`
pub async fn create_default_set(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<(StatusCode, Json<Vec<Reminder>>), AppError> {
    let reminders = state
        .scheduler
        .create_default_set(tenant.tenant_id, invoice_id)
        .await?;
    Ok((StatusCode::CREATED, Json(reminders)))
}

/// `POST /invoices/:invoice_id/reminders`
pub async fn create_reminder(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(invoice_id): Path<Uuid>,
    Json(request): Json<CreateReminderRequest>,
) -> Result<(StatusCode, Json<Reminder>), AppError> {
    let reminder = state
        .scheduler
        .create_single(tenant.tenant_id, invoice_id, request)
        .await?;
    Ok((StatusCode::CREATED, Json(reminder)))
}

/// `POST /invoices/:invoice_id/reminders/cancel`
pub async fn cancel_all(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<CancelledResponse>, AppError> {
    let cancelled = state
        .scheduler
        .cancel_all_for_invoice(tenant.tenant_id, invoice_id)
        .await?;
    Ok(Json(CancelledResponse { cancelled }))
}

/// `POST /reminders/:reminder_id/cancel`
pub async fn cancel_reminder(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(reminder_id): Path<Uuid>,
) -> Result<Json<Reminder>, AppError> {
    Ok(Json(state.scheduler.cancel(tenant.tenant_id, reminder_id).await?))
}

/// `POST /reminders/:reminder_id/send`
pub async fn send_now(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(reminder_id): Path<Uuid>,
) -> Result<Json<Reminder>, AppError> {
    let reminder = state
        .scheduler
        .send_now(tenant.tenant_id, reminder_id)
        .await?;
    Ok(Json(reminder))
}
