//! Probe contract the orchestrator drives, plus the server and summary types it returns.

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// A test server chosen by best-server discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: String,
    pub sponsor: String,
    /// City / site name.
    pub name: String,
    pub country: String,
    pub host: String,
    /// Upload endpoint; download and latency URLs are derived from it.
    pub url: String,
    /// Latency estimate measured during selection.
    pub latency_ms: f64,
}

impl ServerInfo {
    /// "Sponsor (Name, Country)"
    pub fn display_name(&self) -> String {
        format!("{} ({}, {})", self.sponsor, self.name, self.country)
    }
}

/// Post-test figures reported by the probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeSummary {
    /// More authoritative ping than the selection estimate, when available.
    pub ping_ms: Option<f64>,
}

/// Transport-level sampler driven by the orchestrator.
///
/// Each call may block for seconds; none of them observe cancellation.
#[async_trait::async_trait]
pub trait SpeedProbe: Send + Sync {
    /// Discover candidate servers and return the one with the lowest latency.
    async fn best_server(&self) -> Result<ServerInfo>;

    /// Saturate the downlink; returns achieved bits per second.
    async fn download(&self, server: &ServerInfo) -> Result<f64>;

    /// Saturate the uplink; returns achieved bits per second.
    async fn upload(&self, server: &ServerInfo) -> Result<f64>;

    /// Results accessor queried after the upload phase.
    async fn summary(&self, server: &ServerInfo) -> ProbeSummary;
}
