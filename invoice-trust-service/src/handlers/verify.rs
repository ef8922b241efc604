//! Public verification and the tenant audit view.

use crate::middleware::TenantContext;
use crate::models::{VerificationLog, VerificationResult};
use crate::startup::AppState;
use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{header::USER_AGENT, HeaderMap},
    Json,
};
use serde::Deserialize;
use service_core::error::AppError;
use std::net::SocketAddr;
use uuid::Uuid;

const MAX_CODE_LEN: usize = 128;
const MAX_USER_AGENT_LEN: usize = 512;

/// `GET /verify/:code`. Unknown codes answer 200 with `NOT_FOUND`.
pub async fn verify_invoice(
    State(state): State<AppState>,
    Path(code): Path<String>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Json<VerificationResult>, AppError> {
    let code = code.trim();
    if code.is_empty() || code.len() > MAX_CODE_LEN {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Invalid verification code"
        )));
    }

    let peer = connect_info.map(|ConnectInfo(addr)| addr.ip());
    let ip = state
        .trusted_proxies
        .client_ip(&headers, peer)
        .map(|ip| ip.to_string());
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|ua| ua.chars().take(MAX_USER_AGENT_LEN).collect::<String>());

    let result = state.engine.verify(code, ip, user_agent).await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

/// `GET /invoices/:invoice_id/verifications`
pub async fn list_verifications(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(invoice_id): Path<Uuid>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<VerificationLog>>, AppError> {
    let entries = state
        .engine
        .list_verifications(tenant.tenant_id, invoice_id, query.limit)
        .await?;
    Ok(Json(entries))
}
