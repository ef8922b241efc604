//! Invoice sealing and tamper verification.

use crate::models::{
    Invoice, InvoiceSummary, NewVerificationLog, VerificationLog, VerificationResult,
    VerificationStatus,
};
use crate::services::invoices::owned_invoice;
use crate::services::metrics::record_verification;
use crate::services::store::TrustStore;
use chrono::{NaiveDate, Utc};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use service_core::error::AppError;
use service_core::utils::signature::{digests_match, keyed_digest};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const CODE_BYTES: usize = 16;

/// Trust-relevant invoice fields in a fixed order. Payment and delivery
/// status are not sealed.
#[derive(Serialize)]
struct SealedFields<'a> {
    invoice_number: &'a str,
    tenant_id: String,
    issuer_name: &'a str,
    buyer_name: &'a str,
    issue_date: NaiveDate,
    total: String,
    currency: &'a str,
    line_items: Vec<SealedLineItem<'a>>,
}

#[derive(Serialize)]
struct SealedLineItem<'a> {
    position: i32,
    description: &'a str,
    quantity: String,
    unit_price: String,
    tax_rate: String,
    total: String,
}

/// Deterministic serialisation of the sealed fields. Decimals are normalised
/// so `10.50` and `10.5` seal identically.
pub fn canonical_payload(invoice: &Invoice) -> Result<String, AppError> {
    let mut items: Vec<_> = invoice.line_items.iter().collect();
    items.sort_by_key(|item| item.position);

    let fields = SealedFields {
        invoice_number: &invoice.invoice_number,
        tenant_id: invoice.tenant_id.hyphenated().to_string(),
        issuer_name: &invoice.issuer_name,
        buyer_name: &invoice.buyer.name,
        issue_date: invoice.issue_date,
        total: invoice.total.normalize().to_string(),
        currency: &invoice.currency,
        line_items: items
            .into_iter()
            .map(|item| SealedLineItem {
                position: item.position,
                description: &item.description,
                quantity: item.quantity.normalize().to_string(),
                unit_price: item.unit_price.normalize().to_string(),
                tax_rate: item.tax_rate.normalize().to_string(),
                total: item.total.normalize().to_string(),
            })
            .collect(),
    };

    serde_json::to_string(&fields).map_err(|e| {
        AppError::InternalError(anyhow::anyhow!("Failed to serialise invoice: {}", e))
    })
}

/// Fresh public verification code: 128 random bits, hex encoded.
pub fn generate_verification_code() -> String {
    let mut bytes = [0u8; CODE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct VerificationEngine {
    store: Arc<dyn TrustStore>,
    secret: SecretString,
}

impl VerificationEngine {
    pub fn new(store: Arc<dyn TrustStore>, secret: SecretString) -> Self {
        Self { store, secret }
    }

    /// Keyed digest over the invoice's verification code and canonical fields.
    pub fn seal(&self, invoice: &Invoice) -> Result<String, AppError> {
        let payload = canonical_payload(invoice)?;
        keyed_digest(
            self.secret.expose_secret().as_bytes(),
            &[&invoice.verification_code, &payload],
        )
        .map_err(AppError::InternalError)
    }

    /// Recompute the seal from stored fields and compare with the stored one.
    #[instrument(skip(self, code, user_agent), fields(ip = ?ip_address))]
    pub async fn verify(
        &self,
        code: &str,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) -> Result<VerificationResult, AppError> {
        let invoice = self.store.get_invoice_by_code(code).await?;

        let (status, invoice_id, summary) = match invoice {
            None => (VerificationStatus::NotFound, None, None),
            Some(invoice) => {
                let expected = self.seal(&invoice)?;
                if digests_match(&invoice.sealed_hash, &expected) {
                    let summary = InvoiceSummary::from(&invoice);
                    (VerificationStatus::Valid, Some(invoice.invoice_id), Some(summary))
                } else {
                    warn!(invoice_id = %invoice.invoice_id, "Invoice seal mismatch");
                    (VerificationStatus::Tampered, Some(invoice.invoice_id), None)
                }
            }
        };

        let entry = NewVerificationLog {
            verification_code: code.to_string(),
            invoice_id,
            status,
            ip_address,
            user_agent,
            verified_at: Utc::now(),
        };
        if let Err(e) = self.store.record_verification(&entry).await {
            warn!(error = %e, "Failed to record verification audit entry");
        }

        record_verification(status.as_str());
        info!(status = status.as_str(), "Verification completed");

        Ok(VerificationResult {
            status,
            invoice: summary,
        })
    }

    /// Audit entries for an invoice owned by `tenant_id`, newest first.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub async fn list_verifications(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        limit: i64,
    ) -> Result<Vec<VerificationLog>, AppError> {
        owned_invoice(self.store.as_ref(), tenant_id, invoice_id).await?;
        self.store
            .list_verifications(invoice_id, limit.clamp(1, 500))
            .await
    }
}
