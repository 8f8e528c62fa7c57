//! Prometheus metrics for monitoring log-agent throughput and errors.
//!
//! All metrics use the default Prometheus registry and follow naming conventions:
//! - Histograms: *_seconds (for latency)
//! - Counters: *_total (for counts)
//!
//! They are served next to the monitor snapshot at `GET /metrics`.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, Encoder, Histogram,
    IntCounter, IntCounterVec, TextEncoder,
};

lazy_static! {
    // ==================== LATENCY METRICS ====================
    pub static ref PARSE_DURATION: Histogram = register_histogram!(
        "log_agent_parse_duration_seconds",
        "Time spent parsing a single access log line",
        vec![0.000_001, 0.000_005, 0.000_01, 0.000_05, 0.0001, 0.0005, 0.001, 0.005]
    )
    .expect("parse duration histogram registers once");
    pub static ref SINK_WRITE_DURATION: Histogram = register_histogram!(
        "log_agent_sink_write_duration_seconds",
        "Round-trip time of a single point write to the sink",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    )
    .expect("sink write histogram registers once");

    // ==================== ERROR COUNTERS ====================
    pub static ref PARSE_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "log_agent_parse_errors_total",
        "Discarded lines by parse error type",
        &["error_type"]
    )
    .expect("parse error counter registers once");

    // ==================== THROUGHPUT METRICS ====================
    pub static ref LINES_READ_TOTAL: IntCounter = register_int_counter!(
        "log_agent_lines_read_total",
        "Lines read from the tailed source"
    )
    .expect("lines read counter registers once");
    pub static ref POINTS_WRITTEN_TOTAL: IntCounter = register_int_counter!(
        "log_agent_points_written_total",
        "Points acknowledged by the sink"
    )
    .expect("points written counter registers once");
}

/// Encodes the default registry in the Prometheus text format.
///
/// Returns the content type together with the encoded body.
pub fn encode() -> Result<(String, Vec<u8>)> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .context("failed to encode prometheus metrics")?;
    Ok((encoder.format_type().to_string(), buffer))
}
