//! Prometheus metrics for the watch loops and tail cursors.
//!
//! All metrics use the default Prometheus registry:
//! - Histograms: *_seconds
//! - Counters: *_total

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, HistogramVec,
    IntCounter, IntCounterVec,
};

pub const MODE_APPEND: &str = "append";
pub const MODE_LATEST: &str = "latest";

lazy_static! {
    pub static ref TICK_DURATION: HistogramVec = register_histogram_vec!(
        "csvtail_tick_duration_seconds",
        "Time spent in one watch-loop tick, excluding the sleep",
        &["mode"],
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    )
    .expect("tick duration histogram registers once");

    pub static ref LINES_READ_TOTAL: IntCounterVec = register_int_counter_vec!(
        "csvtail_lines_read_total",
        "Complete lines handed to the parser",
        &["mode"]
    )
    .expect("lines counter registers once");
    pub static ref ROWS_EMITTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "csvtail_rows_emitted_total",
        "Rows delivered to the row sink",
        &["mode"]
    )
    .expect("rows counter registers once");
    pub static ref PARSE_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "csvtail_parse_errors_total",
        "Chunks dropped because the parser rejected them",
        &["mode"]
    )
    .expect("parse error counter registers once");
    pub static ref READ_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "csvtail_read_errors_total",
        "Transient I/O failures, retried on the next tick",
        &["kind"]
    )
    .expect("read error counter registers once");
    pub static ref CURSOR_RESETS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "csvtail_cursor_resets_total",
        "Cursor restarts from byte 0",
        &["reason"]
    )
    .expect("cursor reset counter registers once");
    pub static ref FILE_RELOADS_TOTAL: IntCounter = register_int_counter!(
        "csvtail_file_reloads_total",
        "Whole-file re-reads in latest-file mode"
    )
    .expect("reload counter registers once");
}

/// Render the default registry in the Prometheus text format.
pub fn render() -> anyhow::Result<(String, Vec<u8>)> {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok((encoder.format_type().to_string(), buffer))
}
