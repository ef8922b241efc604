//! Invoice model.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

/// Payment lifecycle of an invoice. Mutable after issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Draft,
    Pending,
    Paid,
    Overdue,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Draft => "draft",
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Overdue => "overdue",
            PaymentStatus::Cancelled => "cancelled",
        }
    }

    /// Settled invoices never get reminders.
    pub fn is_settled(&self) -> bool {
        matches!(self, PaymentStatus::Paid | PaymentStatus::Cancelled)
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "draft" => Ok(PaymentStatus::Draft),
            "pending" => Ok(PaymentStatus::Pending),
            "paid" => Ok(PaymentStatus::Paid),
            "overdue" => Ok(PaymentStatus::Overdue),
            "cancelled" => Ok(PaymentStatus::Cancelled),
            _ => Err(format!("Invalid payment status: {}", s)),
        }
    }
}

/// Delivery lifecycle of an invoice. Mutable after issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Draft,
    Sent,
    Viewed,
    Downloaded,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Draft => "draft",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Viewed => "viewed",
            DeliveryStatus::Downloaded => "downloaded",
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "draft" => Ok(DeliveryStatus::Draft),
            "sent" => Ok(DeliveryStatus::Sent),
            "viewed" => Ok(DeliveryStatus::Viewed),
            "downloaded" => Ok(DeliveryStatus::Downloaded),
            _ => Err(format!("Invalid delivery status: {}", s)),
        }
    }
}

/// Buyer details captured at issue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct BuyerSnapshot {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(email)]
    pub email: Option<String>,
    #[validate(length(min = 5, max = 20))]
    pub phone: Option<String>,
    pub address: Option<String>,
    pub tax_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub position: i32,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub tax_rate: Decimal,
    pub total: Decimal,
}

/// An issued invoice.
#[derive(Debug, Clone, Serialize)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub tenant_id: Uuid,
    pub invoice_number: String,
    pub issuer_name: String,
    pub buyer: BuyerSnapshot,
    pub currency: String,
    pub issue_date: NaiveDate,
    pub due_date: Option<NaiveDate>,
    pub line_items: Vec<LineItem>,
    pub subtotal: Decimal,
    pub tax_total: Decimal,
    pub total: Decimal,
    pub payment_status: PaymentStatus,
    pub delivery_status: DeliveryStatus,
    pub template_id: String,
    pub verification_code: String,
    #[serde(skip_serializing)]
    pub sealed_hash: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewLineItem {
    #[validate(length(min = 1, max = 1000))]
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    #[serde(default)]
    pub tax_rate: Decimal,
}

/// Input for issuing an invoice.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewInvoice {
    #[validate(length(min = 1, max = 64))]
    pub invoice_number: String,
    #[validate(length(min = 1, max = 255))]
    pub issuer_name: String,
    #[validate(nested)]
    pub buyer: BuyerSnapshot,
    #[validate(length(equal = 3))]
    pub currency: String,
    pub issue_date: NaiveDate,
    pub due_date: Option<NaiveDate>,
    #[validate(length(min = 1, max = 500), nested)]
    pub line_items: Vec<NewLineItem>,
    pub template_id: Option<String>,
    pub payment_status: Option<PaymentStatus>,
}

/// Lifecycle update. Absent fields are left unchanged.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusUpdate {
    pub payment_status: Option<PaymentStatus>,
    pub delivery_status: Option<DeliveryStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DueDateUpdate {
    pub due_date: NaiveDate,
}

const MONEY_SCALE: u32 = 2;

/// Largest amount a `NUMERIC(19, 4)` column holds.
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(2_313_682_943, 2_328_306_436, 0, false, 4);

fn overflow(idx: usize) -> AppError {
    AppError::BadRequest(anyhow::anyhow!(
        "Line item {}: amount exceeds the supported maximum",
        idx + 1
    ))
}

fn bounded(value: Option<Decimal>, idx: usize) -> Result<Decimal, AppError> {
    match value {
        Some(v) if v.abs() <= MAX_AMOUNT => Ok(v),
        _ => Err(overflow(idx)),
    }
}

impl NewInvoice {
    /// Priced line items plus (subtotal, tax_total, total). Amounts beyond
    /// `MAX_AMOUNT` are rejected.
    pub fn price(&self) -> Result<(Vec<LineItem>, Decimal, Decimal, Decimal), AppError> {
        let hundred = Decimal::from(100);
        let mut subtotal = Decimal::ZERO;
        let mut tax_total = Decimal::ZERO;
        let mut items = Vec::with_capacity(self.line_items.len());

        for (idx, item) in self.line_items.iter().enumerate() {
            bounded(Some(item.quantity), idx)?;
            bounded(Some(item.unit_price), idx)?;
            let net = bounded(
                item.quantity
                    .checked_mul(item.unit_price)
                    .map(|v| v.round_dp(MONEY_SCALE)),
                idx,
            )?;
            let tax = bounded(
                net.checked_mul(item.tax_rate)
                    .and_then(|v| v.checked_div(hundred))
                    .map(|v| v.round_dp(MONEY_SCALE)),
                idx,
            )?;
            let total = bounded(net.checked_add(tax), idx)?;
            subtotal = bounded(subtotal.checked_add(net), idx)?;
            tax_total = bounded(tax_total.checked_add(tax), idx)?;

            items.push(LineItem {
                position: idx as i32 + 1,
                description: item.description.clone(),
                quantity: item.quantity,
                unit_price: item.unit_price,
                tax_rate: item.tax_rate,
                total,
            });
        }

        let last = self.line_items.len().saturating_sub(1);
        let total = bounded(subtotal.checked_add(tax_total), last)?;
        Ok((items, subtotal, tax_total, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn line(description: &str, quantity: i64, unit_price: &str, tax_rate: i64) -> NewLineItem {
        NewLineItem {
            description: description.to_string(),
            quantity: Decimal::from(quantity),
            unit_price: unit_price.parse().unwrap(),
            tax_rate: Decimal::from(tax_rate),
        }
    }

    fn invoice_with(line_items: Vec<NewLineItem>) -> NewInvoice {
        NewInvoice {
            invoice_number: "INV-1".to_string(),
            issuer_name: "Acme".to_string(),
            buyer: BuyerSnapshot {
                name: "Buyer".to_string(),
                email: None,
                phone: None,
                address: None,
                tax_id: None,
            },
            currency: "USD".to_string(),
            issue_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            due_date: None,
            line_items,
            template_id: None,
            payment_status: None,
        }
    }

    #[test]
    fn prices_line_items_with_tax() {
        let input = invoice_with(vec![
            line("Design", 2, "150.00", 18),
            line("Hosting", 1, "20.00", 0),
        ]);

        let (items, subtotal, tax_total, total) = input.price().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].position, 1);
        assert_eq!(items[0].total, "354.00".parse::<Decimal>().unwrap());
        assert_eq!(subtotal, "320.00".parse::<Decimal>().unwrap());
        assert_eq!(tax_total, "54.00".parse::<Decimal>().unwrap());
        assert_eq!(total, "374.00".parse::<Decimal>().unwrap());
    }

    #[test]
    fn oversized_amounts_are_rejected() {
        let mut huge = line("Huge", 1, "1", 0);
        huge.quantity = Decimal::MAX;
        huge.unit_price = Decimal::from(2);
        let err = invoice_with(vec![huge]).price().unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        let product = invoice_with(vec![line("Bulk", 1_000_000_000_000_000, "1000000000000000", 0)]);
        assert!(matches!(product.price(), Err(AppError::BadRequest(_))));

        // Each line fits but the running subtotal does not.
        let half = line("Half", 1, "600000000000000", 0);
        let summed = invoice_with(vec![half.clone(), half]);
        assert!(matches!(summed.price(), Err(AppError::BadRequest(_))));

        let at_limit = invoice_with(vec![line("Max", 1, "999999999999999.99", 0)]);
        assert!(at_limit.price().is_ok());
        assert!(MAX_AMOUNT > "999999999999999.99".parse::<Decimal>().unwrap());
    }

    #[test]
    fn status_strings_round_trip_through_storage_form() {
        for status in [
            PaymentStatus::Draft,
            PaymentStatus::Pending,
            PaymentStatus::Paid,
            PaymentStatus::Overdue,
            PaymentStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<PaymentStatus>(), Ok(status));
        }
        assert!("refunded".parse::<PaymentStatus>().is_err());
        assert!(PaymentStatus::Paid.is_settled());
        assert!(!PaymentStatus::Overdue.is_settled());
    }
}
