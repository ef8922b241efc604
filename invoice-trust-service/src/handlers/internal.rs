//! Operator endpoints behind the internal API key.

use crate::startup::AppState;
use crate::workers::DispatchSummary;
use axum::{extract::State, Json};
use service_core::error::AppError;

/// `POST /internal/reminders/dispatch`: one dispatch run, now.
pub async fn trigger_dispatch(
    State(state): State<AppState>,
) -> Result<Json<DispatchSummary>, AppError> {
    let summary = state.dispatcher.run().await?;
    Ok(Json(summary))
}
