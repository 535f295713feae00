//! Metric names and recorder setup.
//!
//! Metric handles are resolved through the process-global `metrics` recorder;
//! the recorder itself is installed explicitly by the binary (or not at all,
//! as in tests, where the macros become no-ops).

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Envelopes dispatched to the handler chain, labeled by route.
pub const HANDLER_EVENTS_TOTAL: &str = "streambus_handler_events_total";
/// Dispatches that resolved to a Retry outcome, labeled by route.
pub const HANDLER_FAILURES_TOTAL: &str = "streambus_handler_failures_total";
/// Time spent in the handler chain, labeled by route.
pub const HANDLER_DURATION_SECONDS: &str = "streambus_handler_duration_seconds";
/// Records dropped after repeated dead-letter append failures.
pub const RETRY_APPEND_FAILURES_TOTAL: &str = "streambus_retry_store_append_failures_total";
/// Consumer instances terminated by a fatal broker error.
pub const CONSUMER_FATAL_ERRORS_TOTAL: &str = "streambus_consumer_fatal_errors_total";

pub fn setup_metrics_recorder() -> PrometheusHandle {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)
        .unwrap()
        .install_recorder()
        .unwrap()
}
