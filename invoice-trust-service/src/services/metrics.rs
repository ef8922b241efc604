//! Metrics module for invoice-trust-service.
//! HTTP request metrics come from the `metrics` recorder installed here;
//! domain metrics are Prometheus collectors in the default registry.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram, register_histogram_vec, register_int_counter_vec,
    Encoder, Histogram, HistogramVec, IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

static METRICS_HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Storage query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "invoice_trust_db_query_duration_seconds",
            "Storage query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Verification outcomes
pub static VERIFICATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "invoice_trust_verifications_total",
            "Verification requests by outcome"
        ),
        &["status"]
    )
    .expect("Failed to register VERIFICATIONS_TOTAL")
});

/// Invoices sealed (per-tenant metering)
pub static INVOICES_ISSUED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("invoice_trust_invoices_issued_total", "Invoices issued by tenant"),
        &["tenant_id"]
    )
    .expect("Failed to register INVOICES_ISSUED_TOTAL")
});

/// Reminders created
pub static REMINDERS_CREATED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "invoice_trust_reminders_created_total",
            "Reminders created by tenant and type"
        ),
        &["tenant_id", "reminder_type"]
    )
    .expect("Failed to register REMINDERS_CREATED_TOTAL")
});

/// Reminder state transitions
pub static REMINDER_TRANSITIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "invoice_trust_reminder_transitions_total",
            "Reminder transitions by target status"
        ),
        &["status"]
    )
    .expect("Failed to register REMINDER_TRANSITIONS_TOTAL")
});

/// Delivery attempts
pub static DELIVERY_ATTEMPTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "invoice_trust_delivery_attempts_total",
            "Delivery attempts by channel and result"
        ),
        &["channel", "result"]
    )
    .expect("Failed to register DELIVERY_ATTEMPTS_TOTAL")
});

/// Dispatch run duration
pub static DISPATCH_RUN_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(histogram_opts!(
        "invoice_trust_dispatch_run_duration_seconds",
        "Duration of reminder dispatch runs",
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]
    ))
    .expect("Failed to register DISPATCH_RUN_DURATION")
});

/// Dispatch outcome counts across runs
pub static DISPATCH_OUTCOMES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "invoice_trust_dispatch_outcomes_total",
            "Reminders processed by dispatch runs, by outcome"
        ),
        &["outcome"]
    )
    .expect("Failed to register DISPATCH_OUTCOMES_TOTAL")
});

/// Quota rejections
pub static QUOTA_REJECTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "invoice_trust_quota_rejections_total",
            "Quota rejections by tenant and feature"
        ),
        &["tenant_id", "feature"]
    )
    .expect("Failed to register QUOTA_REJECTIONS_TOTAL")
});

/// Initialize metrics. Safe to call more than once.
pub fn init_metrics() {
    METRICS_HANDLE.get_or_init(|| match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Prometheus recorder not installed");
            None
        }
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
    let _ = &*VERIFICATIONS_TOTAL;
    let _ = &*INVOICES_ISSUED_TOTAL;
    let _ = &*REMINDERS_CREATED_TOTAL;
    let _ = &*REMINDER_TRANSITIONS_TOTAL;
    let _ = &*DELIVERY_ATTEMPTS_TOTAL;
    let _ = &*DISPATCH_RUN_DURATION;
    let _ = &*DISPATCH_OUTCOMES_TOTAL;
    let _ = &*QUOTA_REJECTIONS_TOTAL;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let mut output = METRICS_HANDLE
        .get()
        .and_then(|handle| handle.as_ref())
        .map(|handle| handle.render())
        .unwrap_or_default();

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    output.push_str(&String::from_utf8_lossy(&buffer));
    output
}

pub fn record_verification(status: &str) {
    VERIFICATIONS_TOTAL.with_label_values(&[status]).inc();
}

pub fn record_invoice_issued(tenant_id: &str) {
    INVOICES_ISSUED_TOTAL.with_label_values(&[tenant_id]).inc();
}

pub fn record_reminders_created(tenant_id: &str, reminder_type: &str, count: u64) {
    REMINDERS_CREATED_TOTAL
        .with_label_values(&[tenant_id, reminder_type])
        .inc_by(count);
}

pub fn record_reminder_transition(status: &str, count: u64) {
    REMINDER_TRANSITIONS_TOTAL
        .with_label_values(&[status])
        .inc_by(count);
}

pub fn record_delivery_attempt(channel: &str, result: &str) {
    DELIVERY_ATTEMPTS_TOTAL
        .with_label_values(&[channel, result])
        .inc();
}

pub fn record_dispatch_run(duration_secs: f64, sent: u64, failed: u64, skipped: u64) {
    DISPATCH_RUN_DURATION.observe(duration_secs);
    DISPATCH_OUTCOMES_TOTAL.with_label_values(&["sent"]).inc_by(sent);
    DISPATCH_OUTCOMES_TOTAL
        .with_label_values(&["failed"])
        .inc_by(failed);
    DISPATCH_OUTCOMES_TOTAL
        .with_label_values(&["skipped"])
        .inc_by(skipped);
}

pub fn record_quota_rejection(tenant_id: &str, feature: &str) {
    QUOTA_REJECTIONS_TOTAL
        .with_label_values(&[tenant_id, feature])
        .inc();
}
