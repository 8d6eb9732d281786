//! Prometheus metrics for credit-service.
//!
//! Domain metrics live in the default `prometheus` registry. HTTP request
//! metrics come from the service-core middleware through the `metrics`
//! facade and are rendered by a `metrics-exporter-prometheus` recorder.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use prometheus::{
    CounterVec, Encoder, Histogram, HistogramVec, TextEncoder, register_counter_vec,
    register_histogram, register_histogram_vec,
};

/// Counter for metering records by outcome and reason.
pub static METERING_RECORDS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "credit_metering_records_total",
        "Total number of metering records ingested",
        &["outcome", "reason"]
    )
    .expect("Failed to register METERING_RECORDS")
});

/// Counter for coupon redemptions and direct grants by outcome.
pub static GRANT_OPERATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "credit_grant_operations_total",
        "Total number of grant operations",
        &["operation", "outcome"]
    )
    .expect("Failed to register GRANT_OPERATIONS")
});

/// Counter for per-account reconciliations by status.
pub static RECONCILIATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "credit_reconciliations_total",
        "Total number of account reconciliations",
        &["status"]
    )
    .expect("Failed to register RECONCILIATIONS")
});

/// Histogram for full scheduler tick duration.
pub static RECONCILIATION_TICK_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "credit_reconciliation_tick_duration_seconds",
        "Scheduler tick duration in seconds",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]
    )
    .expect("Failed to register RECONCILIATION_TICK_DURATION")
});

/// Counter for notifications by kind.
pub static NOTIFICATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "credit_notifications_total",
        "Total number of credit notifications",
        &["kind", "status"]
    )
    .expect("Failed to register NOTIFICATIONS")
});

/// Counter for paid-instance terminations by outcome.
pub static INSTANCE_TERMINATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "credit_instance_terminations_total",
        "Total number of paid instance terminations",
        &["outcome"]
    )
    .expect("Failed to register INSTANCE_TERMINATIONS")
});

/// Counter for launch decisions.
pub static LAUNCH_DECISIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "credit_launch_decisions_total",
        "Total number of instance launch decisions",
        &["decision"]
    )
    .expect("Failed to register LAUNCH_DECISIONS")
});

/// Histogram for database query duration.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "credit_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

static HTTP_METRICS: Lazy<Option<PrometheusHandle>> =
    Lazy::new(|| match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install HTTP metrics recorder");
            None
        }
    });

/// Initialize all metrics (forces lazy initialization). Safe to call more
/// than once per process.
pub fn init_metrics() {
    Lazy::force(&HTTP_METRICS);
    Lazy::force(&METERING_RECORDS);
    Lazy::force(&GRANT_OPERATIONS);
    Lazy::force(&RECONCILIATIONS);
    Lazy::force(&RECONCILIATION_TICK_DURATION);
    Lazy::force(&NOTIFICATIONS);
    Lazy::force(&INSTANCE_TERMINATIONS);
    Lazy::force(&LAUNCH_DECISIONS);
    Lazy::force(&DB_QUERY_DURATION);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    let mut text = String::from_utf8(buffer).unwrap_or_default();
    if let Some(handle) = HTTP_METRICS.as_ref() {
        text.push_str(&handle.render());
    }
    text
}

pub fn record_metering(outcome: &str, reason: &str) {
    METERING_RECORDS.with_label_values(&[outcome, reason]).inc();
}

pub fn record_grant_operation(operation: &str, outcome: &str) {
    GRANT_OPERATIONS
        .with_label_values(&[operation, outcome])
        .inc();
}

pub fn record_reconciliation(status: &str) {
    RECONCILIATIONS.with_label_values(&[status]).inc();
}

pub fn record_notification(kind: &str, status: &str) {
    NOTIFICATIONS.with_label_values(&[kind, status]).inc();
}

pub fn record_termination(outcome: &str) {
    INSTANCE_TERMINATIONS.with_label_values(&[outcome]).inc();
}

pub fn record_launch_decision(decision: &str) {
    LAUNCH_DECISIONS.with_label_values(&[decision]).inc();
}
