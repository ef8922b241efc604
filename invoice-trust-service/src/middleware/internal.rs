//! Guard for operator-only routes.

use crate::startup::AppState;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::utils::signature::digests_match;

pub const INTERNAL_KEY_HEADER: &str = "x-internal-api-key";

/// Requires `x-internal-api-key` to match the configured key. Without a
/// configured key the routes are closed.
pub async fn internal_key_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get(INTERNAL_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    let authorized = match (&state.internal_api_key, provided) {
        (Some(expected), Some(key)) => digests_match(expected.expose_secret(), key),
        _ => false,
    };

    if authorized {
        next.run(request).await
    } else {
        tracing::warn!(path = %request.uri().path(), "Rejected internal API call");
        AppError::Unauthorized(anyhow::anyhow!("Invalid or missing internal API key"))
            .into_response()
    }
}
