//! Operational counters
//!
//! Emitted through the `metrics` facade once per run. Without an installed
//! recorder the calls are no-ops; the binary installs the Prometheus exporter
//! when `--metrics-addr` is given.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

use crate::coordinator::RunSummary;

pub const PAYLOADS_FETCHED: &str = "paddock_payloads_fetched_total";
pub const PAYLOADS_ARCHIVED: &str = "paddock_payloads_archived_total";
pub const PAYLOADS_DUPLICATE: &str = "paddock_payloads_duplicate_total";
pub const ROWS_NORMALIZED: &str = "paddock_rows_normalized_total";
pub const ROWS_DROPPED: &str = "paddock_rows_dropped_total";
pub const AGGREGATIONS_RECOMPUTED: &str = "paddock_aggregations_recomputed_total";
pub const UNIT_FAILURES: &str = "paddock_unit_failures_total";
pub const RUN_DURATION: &str = "paddock_run_duration_seconds";

/// Serve `/metrics` on `addr` for the lifetime of the process
pub fn install_prometheus(addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("cannot start metrics exporter on {}: {}", addr, e))
}

/// Emit the counters of a finished run
pub fn record_run(summary: &RunSummary) {
    counter!(PAYLOADS_FETCHED, summary.payloads_fetched as u64);
    counter!(PAYLOADS_ARCHIVED, summary.payloads_archived as u64);
    counter!(PAYLOADS_DUPLICATE, summary.payloads_duplicate as u64);
    counter!(ROWS_NORMALIZED, summary.rows_normalized as u64);
    counter!(ROWS_DROPPED, summary.rows_dropped as u64);
    counter!(AGGREGATIONS_RECOMPUTED, summary.aggregations_recomputed as u64);

    for (class, count) in &summary.errors_by_class {
        counter!(UNIT_FAILURES, *count as u64, "class" => class.as_str());
    }

    histogram!(RUN_DURATION, summary.elapsed.as_secs_f64());
}
