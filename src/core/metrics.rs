// src/core/metrics.rs

//! Defines and registers Prometheus metrics for probe monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, TextEncoder, register_counter, register_counter_vec,
    register_gauge, register_histogram,
};

lazy_static! {
    // --- Gauges ---
    /// The number of connection streams currently tracked by all dispatchers.
    pub static ref ACTIVE_STREAMS: Gauge =
        register_gauge!("mysqlprobe_active_streams", "Number of MySQL connection streams currently tracked.").unwrap();


    // --- Counters ---
    /// The total number of packets handed to the dispatchers.
    pub static ref PACKETS_RECEIVED_TOTAL: Counter =
        register_counter!("mysqlprobe_packets_received_total", "Total number of packets received from capture.").unwrap();
    /// Packets discarded because they could not be decoded, labeled by reason.
    pub static ref PACKETS_DROPPED_TOTAL: CounterVec =
        register_counter_vec!("mysqlprobe_packets_dropped_total", "Total number of packets dropped by decode failures, labeled by reason.", &["reason"]).unwrap();
    /// The total number of records delivered to the output sink.
    pub static ref MESSAGES_EMITTED_TOTAL: Counter =
        register_counter!("mysqlprobe_messages_emitted_total", "Total number of query records emitted.").unwrap();
    /// The total number of streams closed by the idle sweep.
    pub static ref STREAMS_EVICTED_TOTAL: Counter =
        register_counter!("mysqlprobe_streams_evicted_total", "Total number of idle streams evicted.").unwrap();


    // --- Histograms ---
    /// Observed server response times.
    pub static ref QUERY_LATENCY_SECONDS: Histogram =
        register_histogram!("mysqlprobe_query_latency_seconds", "Observed MySQL response latency in seconds.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}
