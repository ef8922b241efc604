pub mod health;
pub mod internal;
pub mod invoices;
pub mod quota;
pub mod reminders;
pub mod verify;
