//! Self-observability metrics.
//!
//! All metrics carry the `mtls_metrics_` prefix. Labels are bounded:
//! - `kind`: `certificate`, `trust-bundle`
//! - `outcome` (reloads): `updated`, `unchanged`, `rejected`
//! - `outcome` (handshakes): `accepted` or a handshake rejection reason
//! - `decision`: `allow`, `deny`
//! - `method`: request methods; `status`: numeric HTTP status

use std::time::Duration;

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use telemetry_metrics::{counter, gauge, histogram};

/// Install the global Prometheus recorder and return its render handle.
///
/// Can only succeed once per process.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Scrapes are small; anything above a second is an outlier
        .set_buckets_for_metric(
            Matcher::Prefix("mtls_metrics_http_request".to_string()),
            &[0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500],
        )
        .map_err(|e| format!("Failed to set HTTP request buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {e}"))
}

// ============================================================================
// Reload metrics
// ============================================================================

/// Record the outcome of one reload attempt.
///
/// Metric: `mtls_metrics_reloads_total`
/// Labels: `kind`, `outcome`
pub fn record_reload(kind: &'static str, outcome: &'static str) {
    counter!("mtls_metrics_reloads_total",
        "kind" => kind,
        "outcome" => outcome
    )
    .increment(1);
}

/// Publish the number of consecutive rejected reloads.
///
/// Metric: `mtls_metrics_reload_error_streak`
/// Labels: `kind`
///
/// Non-zero means the watcher is serving a stale snapshot.
pub fn set_reload_error_streak(kind: &'static str, streak: u32) {
    gauge!("mtls_metrics_reload_error_streak", "kind" => kind).set(f64::from(streak));
}

/// Publish the `notAfter` of the served leaf certificate.
///
/// Metric: `mtls_metrics_server_cert_expiry_timestamp_seconds`
#[allow(clippy::cast_precision_loss)]
pub fn set_server_cert_expiry(unix_seconds: i64) {
    gauge!("mtls_metrics_server_cert_expiry_timestamp_seconds").set(unix_seconds as f64);
}

// ============================================================================
// Connection metrics
// ============================================================================

/// Record a finished TLS handshake.
///
/// Metric: `mtls_metrics_handshakes_total`
/// Labels: `outcome`
pub fn record_handshake(outcome: &'static str) {
    counter!("mtls_metrics_handshakes_total", "outcome" => outcome).increment(1);
}

/// Record an authorization decision.
///
/// Metric: `mtls_metrics_authorization_total`
/// Labels: `decision`
pub fn record_authorization(decision: &'static str) {
    counter!("mtls_metrics_authorization_total", "decision" => decision).increment(1);
}

/// Record HTTP request completion.
///
/// Metric: `mtls_metrics_http_requests_total`, `mtls_metrics_http_request_duration_seconds`
/// Labels: `method`, `status`
pub fn record_http_request(method: &str, status_code: u16, duration: Duration) {
    histogram!("mtls_metrics_http_request_duration_seconds",
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());

    counter!("mtls_metrics_http_requests_total",
        "method" => method.to_string(),
        "status" => status_code.to_string()
    )
    .increment(1);
}
