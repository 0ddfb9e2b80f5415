//! Shared fixtures for integration tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{bail, Result};
use speedwatch::measure::{ProbeSummary, ServerInfo, SpeedProbe};

/// Probe returning fixed figures, optionally slow or failing downloads.
pub struct StaticProbe {
    pub download_bps: f64,
    pub upload_bps: f64,
    pub summary_ping: Option<f64>,
    pub phase_delay: Duration,
    pub fail_download: AtomicBool,
}

impl Default for StaticProbe {
    fn default() -> Self {
        Self {
            download_bps: 93_456_789.0,
            upload_bps: 12_300_000.0,
            summary_ping: Some(14.0),
            phase_delay: Duration::ZERO,
            fail_download: AtomicBool::new(false),
        }
    }
}

impl StaticProbe {
    async fn pause(&self) {
        if !self.phase_delay.is_zero() {
            tokio::time::sleep(self.phase_delay).await;
        }
    }
}

#[async_trait::async_trait]
impl SpeedProbe for StaticProbe {
    async fn best_server(&self) -> Result<ServerInfo> {
        self.pause().await;
        Ok(ServerInfo {
            id: "1".to_string(),
            sponsor: "Acme".to_string(),
            name: "NYC".to_string(),
            country: "US".to_string(),
            host: "speed.acme.test:8080".to_string(),
            url: "http://speed.acme.test:8080/speedtest/upload.php".to_string(),
            latency_ms: 21.0,
        })
    }

    async fn download(&self, _server: &ServerInfo) -> Result<f64> {
        self.pause().await;
        if self.fail_download.load(Ordering::SeqCst) {
            bail!("connection reset by peer");
        }
        Ok(self.download_bps)
    }

    async fn upload(&self, _server: &ServerInfo) -> Result<f64> {
        self.pause().await;
        Ok(self.upload_bps)
    }

    async fn summary(&self, _server: &ServerInfo) -> ProbeSummary {
        ProbeSummary {
            ping_ms: self.summary_ping,
        }
    }
}
