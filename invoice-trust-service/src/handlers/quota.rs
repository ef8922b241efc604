//! Quota and plan checks.

use crate::middleware::TenantContext;
use crate::models::{Feature, QuotaUsage};
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use service_core::error::AppError;

#[derive(Debug, Serialize)]
pub struct LimitCheck {
    pub feature: Feature,
    pub allowed: bool,
}

#[derive(Debug, Serialize)]
pub struct TemplateCheck {
    pub template_id: String,
    pub allowed: bool,
}

/// `GET /quota`
pub async fn usage(
    State(state): State<AppState>,
    tenant: TenantContext,
) -> Result<Json<QuotaUsage>, AppError> {
    Ok(Json(state.quota.usage(tenant.tenant_id).await?))
}

/// `GET /quota/:feature`
pub async fn check_limit(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(feature): Path<String>,
) -> Result<Json<LimitCheck>, AppError> {
    let feature: Feature = feature
        .parse()
        .map_err(|e: String| AppError::BadRequest(anyhow::anyhow!(e)))?;
    let allowed = state.quota.check_limit(tenant.tenant_id, feature).await;
    Ok(Json(LimitCheck { feature, allowed }))
}

/// `GET /quota/templates/:template_id`
pub async fn can_use_template(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(template_id): Path<String>,
) -> Json<TemplateCheck> {
    let allowed = state
        .quota
        .can_use_template(tenant.tenant_id, &template_id)
        .await;
    Json(TemplateCheck {
        template_id,
        allowed,
    })
}
