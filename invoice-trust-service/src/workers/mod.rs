pub mod dispatch;

pub use dispatch::{DispatchSummary, ReminderDispatchWorker};
