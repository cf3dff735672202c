//! Prometheus metrics exposition
//!
//! Gateway-level series recorded here:
//!
//! - `gateway_requests_total` (counter): label `status`
//! - `gateway_request_duration_seconds` (histogram): label `status`
//! - `gateway_resolve_failures_total` (counter): label `kind`
//! - `gateway_upstream_errors_total` (counter): label `error_type`
//!
//! The distributor records its own series (`distributor_channel_transitions_total`,
//! `distributor_rate_limit_decisions_total`) through the same global recorder.

use distributor::ErrorKind;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Bucket boundaries from 5ms to 120s. Model calls run much longer than
/// plain HTTP proxying, so the upper end follows the default upstream timeout.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("gateway_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// The duration series renders as a histogram (`_bucket` lines) rather than
/// the exporter's default summary.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a completed relay request.
pub fn record_request(status: u16, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("gateway_requests_total", "status" => status_str.clone()).increment(1);
    metrics::histogram!("gateway_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Record a resolution the distributor refused.
pub fn record_resolve_failure(kind: ErrorKind) {
    metrics::counter!("gateway_resolve_failures_total", "kind" => kind.label()).increment(1);
}

/// Record an upstream transport error with a classification label.
pub fn record_upstream_error(error_type: &'static str) {
    metrics::counter!("gateway_upstream_errors_total", "error_type" => error_type).increment(1);
}
