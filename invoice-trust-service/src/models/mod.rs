//! Domain models for invoice-trust-service.

mod invoice;
mod plan;
mod quota;
mod reminder;
mod tenant;
mod verification;

pub use invoice::{
    BuyerSnapshot, DeliveryStatus, DueDateUpdate, Invoice, LineItem, NewInvoice, NewLineItem,
    PaymentStatus, StatusUpdate,
};
pub use plan::{CounterKind, Feature, Limit, PlanCatalog, PlanLimits, PlanTier, ALL_TEMPLATES};
pub use quota::{QuotaCounter, QuotaUsage, UsageLine};
pub use reminder::{
    Channel, ClaimScope, CreateReminderRequest, DispatchOutcome, NewReminder, Reminder,
    ReminderStatus, ReminderType,
};
pub use tenant::{IntegrationSettings, ReminderSettings, Tenant, TenantSettings};
pub use verification::{
    InvoiceSummary, NewVerificationLog, VerificationLog, VerificationResult, VerificationStatus,
};
