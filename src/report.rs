//! Measurement result formatting for terminal output.

use crate::measure::MeasurementResult;

/// Format a throughput figure, switching to Gbps above 1000 Mbps.
pub fn format_speed(mbps: f64) -> String {
    if mbps >= 1000.0 {
        format!("{:.2} Gbps", mbps / 1000.0)
    } else {
        format!("{:.2} Mbps", mbps)
    }
}

/// One-line summary of a completed measurement.
pub fn format_result(result: &MeasurementResult) -> String {
    format!(
        "Download: {} | Upload: {} | Ping: {:.0} ms | Server: {}",
        format_speed(result.download_mbps()),
        format_speed(result.upload_mbps()),
        result.ping_ms(),
        result.server(),
    )
}

/// Compact line for history listings.
pub fn format_history_line(result: &MeasurementResult) -> String {
    format!(
        "{} | {:.2}/{:.2} Mbps | {:.0} ms",
        result.timestamp(),
        result.download_mbps(),
        result.upload_mbps(),
        result.ping_ms(),
    )
}
