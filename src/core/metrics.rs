//! Prometheus metrics for monitoring the gateway.

use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder, HistogramVec,
    IntCounter, IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Container for all application metrics.
pub struct Metrics {
    /// Requests by client protocol, model and response status
    pub requests_total: IntCounterVec,

    /// Upstream call latency in seconds, per upstream config id
    pub upstream_latency: HistogramVec,

    /// Credential refresh attempts by provider and outcome (`success`/`failure`)
    pub credential_refresh_total: IntCounterVec,

    /// Background jobs dropped because the queue was full
    pub background_dropped_total: IntCounter,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Initialize the metrics registry.
///
/// This should be called once at application startup. Subsequent calls will
/// return the same instance.
pub fn init_metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let requests_total = register_int_counter_vec!(
            "gateway_requests_total",
            "Total number of proxied requests",
            &["protocol", "model", "status"]
        )
        .expect("Failed to register requests_total metric");

        let upstream_latency = register_histogram_vec!(
            "gateway_upstream_latency_seconds",
            "Upstream call latency in seconds",
            &["upstream"],
            vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]
        )
        .expect("Failed to register upstream_latency metric");

        let credential_refresh_total = register_int_counter_vec!(
            "gateway_credential_refresh_total",
            "Credential token refresh attempts",
            &["provider", "outcome"]
        )
        .expect("Failed to register credential_refresh_total metric");

        let background_dropped_total = register_int_counter!(
            "gateway_background_dropped_total",
            "Background jobs dropped because the queue was full"
        )
        .expect("Failed to register background_dropped_total metric");

        Metrics {
            requests_total,
            upstream_latency,
            credential_refresh_total,
            background_dropped_total,
        }
    })
}

/// Get the global metrics instance, registering it on first use.
pub fn get_metrics() -> &'static Metrics {
    init_metrics()
}

/// Render the default registry in the Prometheus text format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        let metrics = init_metrics();
        let metrics2 = get_metrics();
        assert!(std::ptr::eq(metrics, metrics2));
    }

    #[test]
    fn test_requests_total_metric() {
        let metrics = init_metrics();
        let labels = ["openai", "gpt-4-unique-metrics-test", "200"];

        let initial = metrics.requests_total.with_label_values(&labels).get();
        metrics.requests_total.with_label_values(&labels).inc();
        let after = metrics.requests_total.with_label_values(&labels).get();

        assert_eq!(after, initial + 1);
    }

    #[test]
    fn test_upstream_latency_metric() {
        let metrics = init_metrics();
        metrics
            .upstream_latency
            .with_label_values(&["latency-test-upstream"])
            .observe(1.5);
        metrics
            .upstream_latency
            .with_label_values(&["latency-test-upstream"])
            .observe(0.3);

        let count = metrics
            .upstream_latency
            .with_label_values(&["latency-test-upstream"])
            .get_sample_count();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_render_contains_registered_metrics() {
        let metrics = init_metrics();
        metrics
            .credential_refresh_total
            .with_label_values(&["kiro", "success"])
            .inc();

        let text = render();
        assert!(text.contains("gateway_credential_refresh_total"));
    }
}
