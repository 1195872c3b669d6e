//! Prometheus metrics for the SFU service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sfu_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! - `message_type`: bounded by the signaling message set (~12 values)
//! - `outcome`: `ok`, `error`
//! - `kind`: `audio`, `video`
//! - `reason`: bounded auth rejection reasons
//! - `actor_type`: `registry`, `room`, `session`

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return the handle used by `/metrics`.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_message".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set message latency buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_room_ready".to_string()),
            &[
                0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000,
            ],
        )
        .map_err(|e| format!("Failed to set room ready buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Gauges
// ============================================================================

/// Metric: `sfu_connections_active`
pub fn set_connections_active(count: u64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_connections_active").set(count as f64);
}

/// Metric: `sfu_rooms_active`
pub fn set_rooms_active(count: u64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_rooms_active").set(count as f64);
}

/// Metric: `sfu_actor_mailbox_depth`
/// Labels: `actor_type`
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Signaling
// ============================================================================

/// Record one handled signaling message.
///
/// Metric: `sfu_signaling_messages_total`
/// Labels: `message_type`, `outcome` (`ok` | `error`)
pub fn record_signaling_message(message_type: &str, outcome: &str) {
    counter!(
        "sfu_signaling_messages_total",
        "message_type" => message_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Metric: `sfu_message_latency_seconds`
/// Labels: `message_type`
///
/// SLO target: p99 < 100ms excluding media engine round trips.
pub fn record_message_latency(message_type: &str, duration: Duration) {
    histogram!("sfu_message_latency_seconds", "message_type" => message_type.to_string())
        .record(duration.as_secs_f64());
}

/// Time from room creation to routing context ready.
///
/// Metric: `sfu_room_ready_seconds`
pub fn record_room_ready_duration(duration: Duration) {
    histogram!("sfu_room_ready_seconds").record(duration.as_secs_f64());
}

/// Metric: `sfu_producers_total`
/// Labels: `kind`
pub fn record_producer_created(kind: &str) {
    counter!("sfu_producers_total", "kind" => kind.to_string()).increment(1);
}

// ============================================================================
// Failures
// ============================================================================

/// Metric: `sfu_auth_rejections_total`
/// Labels: `reason` (`missing_token`, `invalid_token`)
pub fn record_auth_rejection(reason: &str) {
    counter!("sfu_auth_rejections_total", "reason" => reason.to_string()).increment(1);
}

/// Metric: `sfu_slow_clients_dropped_total`
///
/// Sessions stopped because their client stopped draining its socket.
pub fn record_slow_client_dropped() {
    counter!("sfu_slow_clients_dropped_total").increment(1);
}

/// Metric: `sfu_worker_deaths_total`
///
/// ALERT: any non-zero value means the process is about to exit.
pub fn record_worker_death() {
    counter!("sfu_worker_deaths_total").increment(1);
}

/// Metric: `sfu_actor_panics_total`
/// Labels: `actor_type`
pub fn record_actor_panic(actor_type: &str) {
    counter!("sfu_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}
