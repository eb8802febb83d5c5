//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Broker connection status and reconnects
//! - Produced / consumed / acked / rerouted messages per queue
//! - Delay router decisions
//! - Change poller requests, stale responses and cursor position
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `pipeline_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use catalog_pipeline::metrics;
//!
//! metrics::record_produced("apps", true);
//! metrics::set_cursor(12_345);
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a broker dial outcome.
pub fn record_connection_attempt(connection: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("pipeline_connection_attempts_total", "connection" => connection.to_string(), "status" => status).increment(1);
}

/// Record connection state.
pub fn record_connection_state(connection: &str, state: &str) {
    gauge!("pipeline_connection_state", "connection" => connection.to_string(), "state" => state.to_string()).set(1.0);
}

/// Record a supervisor-initiated reconnect.
pub fn record_reconnect(connection: &str) {
    counter!("pipeline_reconnects_total", "connection" => connection.to_string()).increment(1);
}

/// Record a channel (re)open.
pub fn record_channel_open(queue: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("pipeline_channel_opens_total", "queue" => queue.to_string(), "status" => status).increment(1);
}

/// Record a publish attempt.
pub fn record_produced(queue: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("pipeline_messages_produced_total", "queue" => queue.to_string(), "status" => status).increment(1);
}

/// Record deliveries handed to a handler.
pub fn record_batch(queue: &str, size: usize, duration: Duration) {
    counter!("pipeline_messages_consumed_total", "queue" => queue.to_string()).increment(size as u64);
    histogram!("pipeline_batch_size", "queue" => queue.to_string()).record(size as f64);
    histogram!("pipeline_batch_duration_seconds", "queue" => queue.to_string()).record(duration.as_secs_f64());
}

/// Record a batch abandoned because the broker channel closed mid-consume.
pub fn record_batch_abandoned(queue: &str, size: usize) {
    counter!("pipeline_batches_abandoned_total", "queue" => queue.to_string()).increment(1);
    counter!("pipeline_messages_abandoned_total", "queue" => queue.to_string()).increment(size as u64);
}

/// Record a message acknowledgement.
pub fn record_ack(queue: &str) {
    counter!("pipeline_messages_acked_total", "queue" => queue.to_string()).increment(1);
}

/// Record a message rerouted from one queue to another.
pub fn record_reroute(from: &str, to: &str) {
    counter!("pipeline_messages_rerouted_total", "from" => from.to_string(), "to" => to.to_string()).increment(1);
}

/// Record a delay router decision ("retry", "wait", "dead_letter").
pub fn record_delay_decision(decision: &str) {
    counter!("pipeline_delay_decisions_total", "decision" => decision.to_string()).increment(1);
}

/// Record a changes request sent upstream.
pub fn record_poll(sent: bool) {
    let status = if sent { "sent" } else { "skipped" };
    counter!("pipeline_poll_requests_total", "status" => status).increment(1);
}

/// Record a stale or duplicate changes response.
pub fn record_stale_changes() {
    counter!("pipeline_stale_changes_total").increment(1);
}

/// Record entity changes seen in a delta.
pub fn record_changes(kind: &str, count: usize) {
    counter!("pipeline_entity_changes_total", "kind" => kind.to_string()).increment(count as u64);
}

/// Record detail requests sent upstream.
pub fn record_detail_requests(count: usize) {
    counter!("pipeline_detail_requests_total").increment(count as u64);
}

/// Record entity messages produced from a detail response.
pub fn record_entities(kind: &str, found: usize, missing: usize) {
    counter!("pipeline_entities_total", "kind" => kind.to_string(), "status" => "found").increment(found as u64);
    counter!("pipeline_entities_total", "kind" => kind.to_string(), "status" => "missing").increment(missing as u64);
}

/// Gauge for the persisted change number.
pub fn set_cursor(change_number: u32) {
    gauge!("pipeline_change_number").set(change_number as f64);
}

/// Record a cursor/token file write.
pub fn record_cursor_persist(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("pipeline_cursor_persists_total", "status" => status).increment(1);
}

/// Gauge for catalog session state.
pub fn set_session_state(state: &str) {
    let value = match state {
        "Disconnected" => 0.0,
        "Connecting" => 1.0,
        "Connected" => 2.0,
        "Authenticating" => 3.0,
        "LoggedOn" => 4.0,
        "LoggedOff" => 5.0,
        _ => -1.0,
    };
    gauge!("pipeline_session_state").set(value);
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Connecting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("pipeline_engine_state").set(value);
}

/// Record errors by type.
pub fn record_error(component: &str, error_type: &str) {
    counter!("pipeline_errors_total", "component" => component.to_string(), "error_type" => error_type.to_string()).increment(1);
}
