//! Metrics collection and exposition.
//!
//! # Metrics
//! - `replay_exchanges_captured_total` (counter): exchanges emitted, by input
//! - `replay_framing_errors_total` (counter): abandoned streams, by input
//! - `replay_orphaned_exchanges_total` (counter): requests never matched, by input
//! - `replay_exchanges_filtered_total` (counter): rejected by the global filters, by input
//! - `replay_exchanges_delivered_total` (counter): successful sends, by output
//! - `replay_exchanges_dropped_total` (counter): by output and reason
//! - `replay_failures_total` (counter): sends that failed after all retries
//! - `replay_send_duration_seconds` (histogram): send latency, by output
//! - `replay_queue_depth` (gauge): queued exchanges, by output
//!
//! # Design Decisions
//! - Capture totals are owned by the Input's assembler and published as
//!   absolute values, so a restart of the metric exporter never double counts

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Drop reasons used as the `reason` label.
pub mod reason {
    pub const OVERLOAD: &str = "overload";
    pub const RATE_LIMIT: &str = "rate_limit";
    pub const SAMPLED: &str = "sampled";
}

/// Install the Prometheus recorder and return a handle for rendering.
pub fn install_recorder() -> Result<PrometheusHandle, metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new().install_recorder()
}

pub fn record_captured(input: &str) {
    metrics::counter!("replay_exchanges_captured_total", "input" => input.to_string()).increment(1);
}

pub fn record_filtered(input: &str) {
    metrics::counter!("replay_exchanges_filtered_total", "input" => input.to_string()).increment(1);
}

pub fn publish_capture_totals(input: &str, framing_errors: u64, orphaned: u64) {
    metrics::counter!("replay_framing_errors_total", "input" => input.to_string())
        .absolute(framing_errors);
    metrics::counter!("replay_orphaned_exchanges_total", "input" => input.to_string())
        .absolute(orphaned);
}

pub fn record_delivered(output: &str, seconds: f64) {
    metrics::counter!("replay_exchanges_delivered_total", "output" => output.to_string()).increment(1);
    metrics::histogram!("replay_send_duration_seconds", "output" => output.to_string()).record(seconds);
}

pub fn record_dropped(output: &str, reason: &'static str) {
    metrics::counter!(
        "replay_exchanges_dropped_total",
        "output" => output.to_string(),
        "reason" => reason
    )
    .increment(1);
}

pub fn record_failure(output: &str) {
    metrics::counter!("replay_failures_total", "output" => output.to_string()).increment(1);
}

pub fn set_queue_depth(output: &str, depth: usize) {
    metrics::gauge!("replay_queue_depth", "output" => output.to_string()).set(depth as f64);
}
