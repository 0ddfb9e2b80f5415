//! Measurement core: probe contract, cancellation and the phase orchestrator.

pub mod cancel;
pub mod orchestrator;
pub mod probe;
pub mod speedtest_net;
#[cfg(test)]
pub(crate) mod testing;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::cancel::CancelToken;
pub use self::orchestrator::run_measurement;
pub use self::probe::{ProbeSummary, ServerInfo, SpeedProbe};

/// Format used for `MeasurementResult::timestamp`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One network phase of a measurement, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    ServerSelection,
    Download,
    Upload,
}

impl Phase {
    /// Human-readable progress label emitted before the phase starts.
    pub fn status_label(&self) -> &'static str {
        match self {
            Phase::ServerSelection => "Finding best server...",
            Phase::Download => "Testing download...",
            Phase::Upload => "Testing upload...",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::ServerSelection => write!(f, "server selection"),
            Phase::Download => write!(f, "download"),
            Phase::Upload => write!(f, "upload"),
        }
    }
}

/// A probe failure, tagged with the phase it happened in.
#[derive(Debug, Error)]
#[error("{phase} failed: {source:#}")]
pub struct ProbeError {
    pub phase: Phase,
    #[source]
    pub source: anyhow::Error,
}

impl ProbeError {
    pub fn new(phase: Phase, source: anyhow::Error) -> Self {
        Self { phase, source }
    }
}

/// A completed measurement. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementResult {
    server: String,
    download_mbps: f64,
    upload_mbps: f64,
    ping_ms: f64,
    timestamp: String,
}

/// History entries are plain results; the timestamp already identifies them.
pub type HistoryEntry = MeasurementResult;

impl MeasurementResult {
    pub fn new(
        server: impl Into<String>,
        download_mbps: f64,
        upload_mbps: f64,
        ping_ms: f64,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            server: server.into(),
            download_mbps,
            upload_mbps,
            ping_ms,
            timestamp: timestamp.into(),
        }
    }

    /// "Sponsor (Name, Country)"
    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn download_mbps(&self) -> f64 {
        self.download_mbps
    }

    pub fn upload_mbps(&self) -> f64 {
        self.upload_mbps
    }

    pub fn ping_ms(&self) -> f64 {
        self.ping_ms
    }

    /// Completion time, formatted with [`TIMESTAMP_FORMAT`].
    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }
}

/// Terminal outcome of a measurement that did not fail.
///
/// Cancellation is an outcome, not an error, so callers can tell
/// "stopped by user" apart from "failed".
#[derive(Debug, Clone, PartialEq)]
pub enum MeasurementOutcome {
    Completed(MeasurementResult),
    Cancelled,
}

impl MeasurementOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MeasurementOutcome::Cancelled)
    }

    pub fn into_result(self) -> Option<MeasurementResult> {
        match self {
            MeasurementOutcome::Completed(r) => Some(r),
            MeasurementOutcome::Cancelled => None,
        }
    }
}

/// Convert bits per second to megabits per second.
pub fn bps_to_mbps(bps: f64) -> f64 {
    bps / 1_000_000.0
}
