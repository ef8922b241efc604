pub mod database;
pub mod delivery;
pub mod invoices;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod quota;
pub mod reminders;
pub mod store;
pub mod verification;

pub use database::Database;
pub use delivery::{DeliveryChannel, DeliveryError, DeliveryRouter, MockChannel};
pub use invoices::InvoiceService;
pub use memory::InMemoryStore;
pub use message::MessageRenderer;
pub use quota::QuotaGate;
pub use reminders::ReminderScheduler;
pub use store::TrustStore;
pub use verification::VerificationEngine;
