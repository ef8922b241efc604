//! Tenant invoice endpoints.

use crate::middleware::TenantContext;
use crate::models::{DueDateUpdate, Invoice, NewInvoice, StatusUpdate};
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

/// `POST /invoices`
pub async fn issue_invoice(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(input): Json<NewInvoice>,
) -> Result<(StatusCode, Json<Invoice>), AppError> {
    let invoice = state.invoices.issue(tenant.tenant_id, input).await?;
    Ok((StatusCode::CREATED, Json(invoice)))
}

/// `GET /invoices/:invoice_id`
pub async fn get_invoice(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<Invoice>, AppError> {
    Ok(Json(state.invoices.get(tenant.tenant_id, invoice_id).await?))
}

/// `PATCH /invoices/:invoice_id/status`
pub async fn update_status(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(invoice_id): Path<Uuid>,
    Json(update): Json<StatusUpdate>,
) -> Result<Json<Invoice>, AppError> {
    let invoice = state
        .invoices
        .update_status(tenant.tenant_id, invoice_id, update)
        .await?;
    Ok(Json(invoice))
}

/// `PATCH /invoices/:invoice_id/due-date`
pub async fn change_due_date(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(invoice_id): Path<Uuid>,
    Json(update): Json<DueDateUpdate>,
) -> Result<Json<Invoice>, AppError> {
    let invoice = state
        .invoices
        .change_due_date(tenant.tenant_id, invoice_id, update.due_date)
        .await?;
    Ok(Json(invoice))
}
