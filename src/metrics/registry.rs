use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering the `/metrics`
/// endpoint. Installation happens once per process; later calls get the
/// same handle.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    pub fn install() -> Self {
        static GLOBAL: OnceLock<Metrics> = OnceLock::new();
        GLOBAL
            .get_or_init(|| {
                let handle = PrometheusBuilder::new()
                    .set_buckets_for_metric(
                        metrics_exporter_prometheus::Matcher::Suffix(
                            "_duration_seconds".to_string(),
                        ),
                        LATENCY_BUCKETS,
                    )
                    .expect("valid matcher")
                    .install_recorder()
                    .expect("failed to install metrics recorder");

                describe_metrics();
                Metrics { handle }
            })
            .clone()
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

fn describe_metrics() {
    // request path
    describe_counter!(
        "gateway_http_requests_total",
        Unit::Count,
        "Total HTTP requests processed"
    );
    describe_histogram!(
        "gateway_http_request_duration_seconds",
        Unit::Seconds,
        "Total request duration from client perspective"
    );
    describe_gauge!(
        "gateway_http_requests_in_flight",
        Unit::Count,
        "Number of requests currently being processed"
    );

    // rate limiting
    describe_counter!(
        "gateway_rate_limit_allowed_total",
        Unit::Count,
        "Total requests allowed by the rate limiter"
    );
    describe_counter!(
        "gateway_rate_limit_burst_total",
        Unit::Count,
        "Total requests admitted inside the burst region"
    );
    describe_counter!(
        "gateway_rate_limit_rejected_total",
        Unit::Count,
        "Total requests rejected by the rate limiter"
    );
    describe_counter!(
        "gateway_rate_limit_degraded_total",
        Unit::Count,
        "Requests admitted local-only because the distributed tier failed"
    );

    // queueing
    describe_counter!(
        "gateway_queue_rejected_total",
        Unit::Count,
        "Requests rejected because the wait queue was full"
    );
    describe_counter!(
        "gateway_queue_timeout_total",
        Unit::Count,
        "Requests that timed out waiting for an execution slot"
    );
    describe_counter!(
        "gateway_fallback_served_total",
        Unit::Count,
        "Fallback responses served in place of the backend"
    );

    // upstream
    describe_counter!(
        "gateway_backend_errors_total",
        Unit::Count,
        "Backend calls that failed"
    );
    describe_counter!(
        "gateway_circuit_breaker_rejected_total",
        Unit::Count,
        "Requests rejected by the open circuit breaker"
    );

    // connections
    describe_gauge!(
        "gateway_connections_active",
        Unit::Count,
        "Number of active downstream connections"
    );
    describe_counter!(
        "gateway_connections_total",
        Unit::Count,
        "Total connections accepted"
    );
}
