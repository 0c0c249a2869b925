//! Prometheus metrics for the relay.
//!
//! Metrics are exposed by a dedicated HTTP listener on `METRICS_PORT`
//! (disabled when the port is 0).
//!
//! # Available Metrics
//!
//! ## Counters
//! - `relay_messages_published_total` - Publishes attempted (labels: topic, status)
//! - `relay_messages_forwarded_total` - Broker messages delivered to clients or the buffer (label: topic)
//! - `relay_broker_connect_attempts_total` - Broker connects (label: status)
//!
//! ## Histograms
//! - `relay_publish_duration_seconds` - Connect, publish and disconnect cycle (label: topic)
//!
//! ## Gauges
//! - `relay_active_streams` - Open event streams
//! - `relay_consumer_state` - Background consumer state (0 = disconnected, 1 = connecting, 2 = subscribed)
//! - `relay_consumer_buffer_size` - Entries held by the consumer buffer
//!
//! # Usage
//!
//! ```rust,ignore
//! use mqtt_relay::metrics::{try_init_metrics, record_message_published};
//!
//! try_init_metrics("0.0.0.0:9090".parse()?);
//! record_message_published("demo/messages", "success");
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const MESSAGES_PUBLISHED_TOTAL: &str = "relay_messages_published_total";
    pub const MESSAGES_FORWARDED_TOTAL: &str = "relay_messages_forwarded_total";
    pub const BROKER_CONNECT_ATTEMPTS_TOTAL: &str = "relay_broker_connect_attempts_total";
    pub const PUBLISH_DURATION_SECONDS: &str = "relay_publish_duration_seconds";
    pub const ACTIVE_STREAMS: &str = "relay_active_streams";
    pub const CONSUMER_STATE: &str = "relay_consumer_state";
    pub const CONSUMER_BUFFER_SIZE: &str = "relay_consumer_buffer_size";
}

/// Install the Prometheus exporter and describe all metrics.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::MESSAGES_PUBLISHED_TOTAL,
        "Total number of publish attempts to the broker"
    );
    describe_counter!(
        names::MESSAGES_FORWARDED_TOTAL,
        "Total number of broker messages forwarded to streams or the buffer"
    );
    describe_counter!(
        names::BROKER_CONNECT_ATTEMPTS_TOTAL,
        "Total number of broker connection attempts"
    );

    describe_histogram!(
        names::PUBLISH_DURATION_SECONDS,
        "Duration of a full connect, publish and disconnect cycle in seconds"
    );

    describe_gauge!(names::ACTIVE_STREAMS, "Number of open event streams");
    describe_gauge!(
        names::CONSUMER_STATE,
        "Background consumer state (0 = disconnected, 1 = connecting, 2 = subscribed)"
    );
    describe_gauge!(
        names::CONSUMER_BUFFER_SIZE,
        "Number of entries in the background consumer buffer"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Counters
// =============================================================================

pub fn record_message_published(topic: &str, status: &str) {
    counter!(names::MESSAGES_PUBLISHED_TOTAL, "topic" => topic.to_string(), "status" => status.to_string())
        .increment(1);
}

pub fn record_message_forwarded(topic: &str) {
    counter!(names::MESSAGES_FORWARDED_TOTAL, "topic" => topic.to_string()).increment(1);
}

pub fn record_connect_attempt(status: &str) {
    counter!(names::BROKER_CONNECT_ATTEMPTS_TOTAL, "status" => status.to_string()).increment(1);
}

// =============================================================================
// Histograms
// =============================================================================

pub fn record_publish_duration(topic: &str, duration_secs: f64) {
    histogram!(names::PUBLISH_DURATION_SECONDS, "topic" => topic.to_string())
        .record(duration_secs);
}

// =============================================================================
// Gauges
// =============================================================================

pub fn set_active_streams(count: usize) {
    gauge!(names::ACTIVE_STREAMS).set(count as f64);
}

/// States: 0 = disconnected, 1 = connecting, 2 = subscribed
pub fn set_consumer_state(state: u8) {
    gauge!(names::CONSUMER_STATE).set(f64::from(state));
}

pub fn set_consumer_buffer_size(size: usize) {
    gauge!(names::CONSUMER_BUFFER_SIZE).set(size as f64);
}
