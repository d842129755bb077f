//! Prometheus metrics for the relay
//!
//! Tracks filter outcomes, flushes, delivery results and feed connectivity.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

const LABEL_OUTCOME: &str = "outcome";
const LABEL_CHANNEL: &str = "channel";
const LABEL_RESULT: &str = "result";

/// Inbound frames by filter outcome (admitted, rejected, discarded)
static TICKS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickrelay_ticks_total",
        "Inbound feed frames by outcome",
        &[LABEL_OUTCOME]
    )
    .expect("Failed to register ticks_total metric")
});

static FLUSHES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickrelay_flushes_total",
        "Batch windows flushed per channel",
        &[LABEL_CHANNEL]
    )
    .expect("Failed to register flushes_total metric")
});

static FLUSHED_ITEMS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickrelay_flushed_items_total",
        "Items handed to the dispatcher per channel",
        &[LABEL_CHANNEL]
    )
    .expect("Failed to register flushed_items_total metric")
});

/// Delivery attempts per channel and result (ok, failed, skipped)
static DELIVERIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickrelay_deliveries_total",
        "Outbound deliveries per channel and result",
        &[LABEL_CHANNEL, LABEL_RESULT]
    )
    .expect("Failed to register deliveries_total metric")
});

static DELIVERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "tickrelay_delivery_duration_seconds",
        "Outbound delivery latency",
        &[LABEL_CHANNEL],
        vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to register delivery_duration metric")
});

static RECONNECTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "tickrelay_reconnects_total",
        "Reconnect attempts scheduled after a transport fault"
    )
    .expect("Failed to register reconnects_total metric")
});

/// 1 = connected, 0 = disconnected
static FEED_CONNECTED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "tickrelay_feed_connected",
        "Upstream feed connection status"
    )
    .expect("Failed to register feed_connected metric")
});

pub fn inc_admitted() {
    TICKS_TOTAL.with_label_values(&["admitted"]).inc();
}

pub fn inc_rejected() {
    TICKS_TOTAL.with_label_values(&["rejected"]).inc();
}

pub fn inc_discarded() {
    TICKS_TOTAL.with_label_values(&["discarded"]).inc();
}

pub fn record_flush(channel: &str, items: usize) {
    FLUSHES_TOTAL.with_label_values(&[channel]).inc();
    FLUSHED_ITEMS_TOTAL
        .with_label_values(&[channel])
        .inc_by(items as u64);
}

pub fn record_delivery(channel: &str, result: &str) {
    DELIVERIES_TOTAL.with_label_values(&[channel, result]).inc();
}

pub fn observe_delivery_duration(channel: &str, seconds: f64) {
    DELIVERY_DURATION.with_label_values(&[channel]).observe(seconds);
}

pub fn inc_reconnects() {
    RECONNECTS_TOTAL.inc();
}

pub fn set_feed_connected(connected: bool) {
    FEED_CONNECTED.set(i64::from(connected));
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| {
        prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e))
    })
}
