//! Verification results and audit entries.

use super::invoice::Invoice;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    Valid,
    Tampered,
    NotFound,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Valid => "valid",
            VerificationStatus::Tampered => "tampered",
            VerificationStatus::NotFound => "not_found",
        }
    }
}

impl FromStr for VerificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "valid" => Ok(VerificationStatus::Valid),
            "tampered" => Ok(VerificationStatus::Tampered),
            "not_found" => Ok(VerificationStatus::NotFound),
            _ => Err(format!("Invalid verification status: {}", s)),
        }
    }
}

/// Redacted view of a verified invoice.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvoiceSummary {
    pub invoice_number: String,
    pub issuer_name: String,
    pub issue_date: NaiveDate,
    pub total: Decimal,
    pub currency: String,
}

impl From<&Invoice> for InvoiceSummary {
    fn from(invoice: &Invoice) -> Self {
        Self {
            invoice_number: invoice.invoice_number.clone(),
            issuer_name: invoice.issuer_name.clone(),
            issue_date: invoice.issue_date,
            total: invoice.total,
            currency: invoice.currency.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationResult {
    pub status: VerificationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice: Option<InvoiceSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationLog {
    pub log_id: Uuid,
    pub verification_code: String,
    pub invoice_id: Option<Uuid>,
    pub status: VerificationStatus,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub verified_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewVerificationLog {
    pub verification_code: String,
    pub invoice_id: Option<Uuid>,
    pub status: VerificationStatus,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub verified_at: DateTime<Utc>,
}
