// OEM Gateway - Prometheus metrics definitions
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Prometheus metrics for the gateway.
//!
//! Metrics are refreshed from a [`GatewayStatus`] snapshot each time the
//! `/metrics` endpoint is scraped.

use lazy_static::lazy_static;
use oemgateway::{GatewayStatus, HealthStatus, ListenerState};
use prometheus::{
    register_gauge, register_int_counter_vec, register_int_gauge_vec, Encoder, Gauge,
    IntCounterVec, IntGaugeVec, TextEncoder,
};

lazy_static! {
    // ============================================================
    // Gateway
    // ============================================================

    /// Overall health (0=Healthy, 1=Degraded, 2=Unhealthy, 3=Unknown)
    pub static ref HEALTH: Gauge = register_gauge!(
        "oemgateway_health",
        "Gateway health (0=Healthy, 1=Degraded, 2=Unhealthy, 3=Unknown)"
    ).unwrap();

    pub static ref UPTIME_SECONDS: Gauge = register_gauge!(
        "oemgateway_uptime_seconds",
        "Seconds since the gateway was configured"
    ).unwrap();

    // ============================================================
    // Listeners
    // ============================================================

    /// 1 while the listener is acquiring readings
    pub static ref LISTENER_RUNNING: IntGaugeVec = register_int_gauge_vec!(
        "oemgateway_listener_running",
        "Listener running state (1=running)",
        &["instance"]
    ).unwrap();

    pub static ref LISTENER_READINGS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "oemgateway_listener_readings_total",
        "Readings produced by the listener",
        &["instance"]
    ).unwrap();

    pub static ref LISTENER_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "oemgateway_listener_errors_total",
        "Failed acquisition attempts",
        &["instance"]
    ).unwrap();

    // ============================================================
    // Buffers
    // ============================================================

    pub static ref BUFFER_QUEUE_DEPTH: IntGaugeVec = register_int_gauge_vec!(
        "oemgateway_buffer_queue_depth",
        "Readings waiting for delivery",
        &["instance"]
    ).unwrap();

    pub static ref BUFFER_CAPACITY: IntGaugeVec = register_int_gauge_vec!(
        "oemgateway_buffer_capacity",
        "Retention bound of the buffer queue",
        &["instance"]
    ).unwrap();

    pub static ref BUFFER_ACTIVE: IntGaugeVec = register_int_gauge_vec!(
        "oemgateway_buffer_active",
        "Delivery enabled (1=active)",
        &["instance"]
    ).unwrap();

    pub static ref BUFFER_DELIVERED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "oemgateway_buffer_delivered_total",
        "Readings confirmed by the destination",
        &["instance"]
    ).unwrap();

    /// Readings lost to the overflow policy
    pub static ref BUFFER_DROPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "oemgateway_buffer_dropped_total",
        "Readings dropped because the queue was full",
        &["instance"]
    ).unwrap();

    pub static ref BUFFER_FAILED_FLUSHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "oemgateway_buffer_failed_flushes_total",
        "Deliveries that failed and will be retried",
        &["instance"]
    ).unwrap();
}

fn health_value(health: HealthStatus) -> f64 {
    match health {
        HealthStatus::Healthy => 0.0,
        HealthStatus::Degraded => 1.0,
        HealthStatus::Unhealthy => 2.0,
        HealthStatus::Unknown => 3.0,
    }
}

/// Bring a counter up to a running total kept elsewhere
fn advance(counters: &IntCounterVec, instance: &str, total: u64) {
    let counter = counters.with_label_values(&[instance]);
    counter.inc_by(total.saturating_sub(counter.get()));
}

/// Update every metric from a status snapshot
pub fn update_from_status(status: &GatewayStatus) {
    HEALTH.set(health_value(status.health));
    UPTIME_SECONDS.set(status.uptime_secs as f64);

    for l in &status.listeners {
        let name = l.name.as_str();
        LISTENER_RUNNING
            .with_label_values(&[name])
            .set(i64::from(l.state == ListenerState::Running));
        advance(&LISTENER_READINGS_TOTAL, name, l.readings);
        advance(&LISTENER_ERRORS_TOTAL, name, l.acquisition_errors);
    }

    for b in &status.buffers {
        let name = b.name.as_str();
        BUFFER_QUEUE_DEPTH.with_label_values(&[name]).set(b.queued as i64);
        BUFFER_CAPACITY.with_label_values(&[name]).set(b.capacity as i64);
        BUFFER_ACTIVE.with_label_values(&[name]).set(i64::from(b.active));
        advance(&BUFFER_DELIVERED_TOTAL, name, b.stats.delivered);
        advance(&BUFFER_DROPPED_TOTAL, name, b.stats.dropped);
        advance(&BUFFER_FAILED_FLUSHES_TOTAL, name, b.stats.failed_flushes);
    }
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
