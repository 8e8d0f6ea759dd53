//! Metrics definitions for Switchyard.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sy_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `outcome`: dispatch outcomes (6 values)
//! - `scope`: broadcast scopes (all, room, custom)
//! - `status`: success, error
//! - `reason`: bounded close and auth-failure reasons
//!
//! Room names, user ids and connection ids are never used as labels.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return the handle used to render
/// `/metrics`.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Dispatch runs inside the hub loop and should stay well under 10ms.
        .set_buckets_for_metric(
            Matcher::Prefix("sy_dispatch".to_string()),
            &[
                0.0005, 0.001, 0.0025, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250,
            ],
        )
        .map_err(|e| format!("Failed to set dispatch latency buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("sy_lifecycle_shutdown".to_string()),
            &[0.010, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000, 30.000],
        )
        .map_err(|e| format!("Failed to set shutdown duration buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Connections & Rooms (Gauges)
// ============================================================================

/// Metric: `sy_connections_active`
pub fn set_connections_active(count: usize) {
    // usize to f64 conversion is safe for realistic connection counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("sy_connections_active").set(count as f64);
}

/// Metric: `sy_rooms_active`
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sy_rooms_active").set(count as f64);
}

/// Set the worker hub mailbox depth.
///
/// Metric: `sy_hub_mailbox_depth`
///
/// High values mean the hub is falling behind its socket readers.
pub fn set_hub_mailbox_depth(depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sy_hub_mailbox_depth").set(depth as f64);
}

/// Metric: `sy_connections_closed_total`
/// Labels: `reason`
pub fn record_connection_closed(reason: &'static str) {
    counter!("sy_connections_closed_total", "reason" => reason).increment(1);
}

/// Metric: `sy_auth_failures_total`
/// Labels: `reason` (missing_token, invalid_token, malformed_url)
pub fn record_auth_failure(reason: &'static str) {
    counter!("sy_auth_failures_total", "reason" => reason).increment(1);
}

// ============================================================================
// Dispatch
// ============================================================================

/// Record one inbound frame.
///
/// Metrics: `sy_messages_dispatched_total`, `sy_dispatch_duration_seconds`
/// Labels: `outcome`
pub fn record_dispatch(outcome: &'static str, duration: Duration) {
    counter!("sy_messages_dispatched_total", "outcome" => outcome).increment(1);
    histogram!("sy_dispatch_duration_seconds", "outcome" => outcome)
        .record(duration.as_secs_f64());
}

// ============================================================================
// Broadcasts
// ============================================================================

/// Metric: `sy_broadcasts_published_total`
/// Labels: `scope`, `status`
pub fn record_broadcast_published(scope: &'static str, success: bool) {
    let status = if success { "success" } else { "error" };
    counter!("sy_broadcasts_published_total", "scope" => scope, "status" => status).increment(1);
}

/// Local deliveries of one received envelope.
///
/// Metric: `sy_broadcast_deliveries_total`
/// Labels: `scope`
pub fn record_broadcast_delivered(scope: &'static str, recipients: usize) {
    counter!("sy_broadcast_deliveries_total", "scope" => scope).increment(recipients as u64);
}

/// Metric: `sy_broadcast_duplicates_total`
pub fn record_broadcast_duplicate() {
    counter!("sy_broadcast_duplicates_total").increment(1);
}

// ============================================================================
// Cluster & Lifecycle
// ============================================================================

/// Metric: `sy_worker_exits_total`
/// Labels: `status` (graceful, crash)
pub fn record_worker_exit(graceful: bool) {
    let status = if graceful { "graceful" } else { "crash" };
    counter!("sy_worker_exits_total", "status" => status).increment(1);
}

/// Metric: `sy_worker_restarts_total`
pub fn record_worker_restart() {
    counter!("sy_worker_restarts_total").increment(1);
}

/// Metric: `sy_workers_live`
pub fn set_workers_live(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sy_workers_live").set(count as f64);
}

/// Metric: `sy_lifecycle_shutdown_duration_seconds`
/// Labels: `status` (success, timeout)
pub fn record_lifecycle_shutdown(duration: Duration, timed_out: bool) {
    let status = if timed_out { "timeout" } else { "success" };
    histogram!("sy_lifecycle_shutdown_duration_seconds", "status" => status)
        .record(duration.as_secs_f64());
}
