//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Messages**: Upstream messages received by class, decode failures
//! - **Requests**: SUBSCRIBE/UNSUBSCRIBE requests sent and failed
//! - **Consumers**: Consumers removed and values dropped by slow consumers
//! - **Channels**: Active wire channel count
//! - **Connection**: Transport errors and reconnects
//! - **Latency**: Dispatch time per upstream message
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::application::ports::MessageClass;
use crate::domain::subscription::{ChannelRequest, ConsumerKind};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Upstream messages
    describe_counter!(
        "feed_multiplexer_messages_received_total",
        "Total upstream messages received by class"
    );
    describe_counter!(
        "feed_multiplexer_decode_errors_total",
        "Total upstream messages that failed to decode"
    );

    // Requests
    describe_counter!(
        "feed_multiplexer_requests_sent_total",
        "Total subscription requests sent upstream"
    );
    describe_counter!(
        "feed_multiplexer_request_failures_total",
        "Total subscription requests that could not be sent"
    );

    // Consumers
    describe_counter!(
        "feed_multiplexer_consumers_removed_total",
        "Total consumers removed after their sink closed"
    );
    describe_counter!(
        "feed_multiplexer_values_dropped_total",
        "Total values dropped because a consumer queue was full"
    );

    // Channels
    describe_gauge!(
        "feed_multiplexer_active_channels",
        "Number of subscribed upstream wire channels"
    );

    // Connection
    describe_counter!(
        "feed_multiplexer_transport_errors_total",
        "Total non-terminal transport errors"
    );
    describe_counter!(
        "feed_multiplexer_reconnects_total",
        "Total upstream reconnection attempts"
    );

    // Latency
    describe_histogram!(
        "feed_multiplexer_dispatch_seconds",
        "Time to decode and dispatch one upstream message"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

const fn class_label(class: Option<MessageClass>) -> &'static str {
    match class {
        Some(class) => class.as_str(),
        None => "unknown",
    }
}

/// Record an upstream message. `None` marks an unrecognised message.
pub fn record_message_received(class: Option<MessageClass>) {
    counter!(
        "feed_multiplexer_messages_received_total",
        "class" => class_label(class)
    )
    .increment(1);
}

/// Record an upstream message that failed to decode.
pub fn record_decode_error(class: MessageClass) {
    counter!(
        "feed_multiplexer_decode_errors_total",
        "class" => class.as_str()
    )
    .increment(1);
}

/// Record a subscription request sent upstream.
pub fn record_request_sent(request: &ChannelRequest) {
    counter!(
        "feed_multiplexer_requests_sent_total",
        "method" => request.label()
    )
    .increment(1);
}

/// Record a subscription request that could not be sent.
pub fn record_request_failure(request: &ChannelRequest) {
    counter!(
        "feed_multiplexer_request_failures_total",
        "method" => request.label()
    )
    .increment(1);
}

/// Record consumers removed after their sink closed.
pub fn record_consumers_removed(kinds: &[ConsumerKind]) {
    for kind in kinds {
        counter!(
            "feed_multiplexer_consumers_removed_total",
            "kind" => kind.as_str()
        )
        .increment(1);
    }
}

/// Record a value dropped by a full consumer queue.
pub fn record_value_dropped(kind: ConsumerKind) {
    counter!(
        "feed_multiplexer_values_dropped_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Update the active wire channel count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_channels(count: usize) {
    gauge!("feed_multiplexer_active_channels").set(count as f64);
}

/// Record a non-terminal transport error.
pub fn record_transport_error(error_type: &str) {
    counter!(
        "feed_multiplexer_transport_errors_total",
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record an upstream reconnection attempt.
pub fn record_reconnect() {
    counter!("feed_multiplexer_reconnects_total").increment(1);
}

/// Record the time taken to dispatch one upstream message.
pub fn record_dispatch_duration(class: MessageClass, duration: Duration) {
    histogram!(
        "feed_multiplexer_dispatch_seconds",
        "class" => class.as_str()
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
