//! Rolling usage counters.

use super::plan::{CounterKind, Limit, PlanTier};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaCounter {
    pub tenant_id: Uuid,
    pub invoices_count: i64,
    pub pdf_api_usage: i64,
    pub ocr_usage: i64,
    pub last_reset_date: DateTime<Utc>,
}

impl QuotaCounter {
    pub fn new(tenant_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            tenant_id,
            invoices_count: 0,
            pdf_api_usage: 0,
            ocr_usage: 0,
            last_reset_date: now,
        }
    }

    /// More than `window` has passed since the last reset, so counters must
    /// be zeroed before use.
    pub fn window_elapsed(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now.signed_duration_since(self.last_reset_date) > window
    }

    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.invoices_count = 0;
        self.pdf_api_usage = 0;
        self.ocr_usage = 0;
        self.last_reset_date = now;
    }

    pub fn get(&self, kind: CounterKind) -> i64 {
        match kind {
            CounterKind::Invoices => self.invoices_count,
            CounterKind::PdfApi => self.pdf_api_usage,
            CounterKind::Ocr => self.ocr_usage,
        }
    }

    pub fn add(&mut self, kind: CounterKind, amount: i64) {
        match kind {
            CounterKind::Invoices => self.invoices_count += amount,
            CounterKind::PdfApi => self.pdf_api_usage += amount,
            CounterKind::Ocr => self.ocr_usage += amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageLine {
    pub used: i64,
    pub limit: Limit,
}

/// Point-in-time usage for a tenant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaUsage {
    pub tenant_id: Uuid,
    pub plan: PlanTier,
    pub window_started: DateTime<Utc>,
    pub window_ends: DateTime<Utc>,
    pub invoices: UsageLine,
    pub pdf_api: UsageLine,
    pub ocr: UsageLine,
    pub team_members: UsageLine,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_boundary() {
        let now = Utc::now();
        let window = Duration::days(30);
        let mut counter = QuotaCounter::new(Uuid::new_v4(), now - Duration::days(29));
        assert!(!counter.window_elapsed(now, window));

        counter.last_reset_date = now - Duration::days(30);
        assert!(!counter.window_elapsed(now, window));

        counter.last_reset_date = now - Duration::days(30) - Duration::seconds(1);
        assert!(counter.window_elapsed(now, window));

        counter.add(CounterKind::Ocr, 4);
        counter.reset(now);
        assert_eq!(counter.get(CounterKind::Ocr), 0);
        assert_eq!(counter.last_reset_date, now);
    }
}
