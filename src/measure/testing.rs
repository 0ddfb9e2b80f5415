//! Scripted probe for unit tests.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};

use super::{CancelToken, Phase, ProbeSummary, ServerInfo, SpeedProbe};

pub(crate) struct ScriptedProbe {
    server: ServerInfo,
    download_bps: f64,
    upload_bps: f64,
    summary_ping: Option<f64>,
    fail_at: Option<Phase>,
    cancel_during: Option<(Phase, CancelToken)>,
    phase_delay: Duration,
    calls: Mutex<Vec<Phase>>,
}

impl ScriptedProbe {
    pub(crate) fn new() -> Self {
        Self {
            server: ServerInfo {
                id: "4242".to_string(),
                sponsor: "Acme".to_string(),
                name: "NYC".to_string(),
                country: "US".to_string(),
                host: "speed.acme.test:8080".to_string(),
                url: "http://speed.acme.test:8080/speedtest/upload.php".to_string(),
                latency_ms: 14.0,
            },
            download_bps: 93_456_789.0,
            upload_bps: 12_300_000.0,
            summary_ping: None,
            fail_at: None,
            cancel_during: None,
            phase_delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn fail_at(mut self, phase: Phase) -> Self {
        self.fail_at = Some(phase);
        self
    }

    pub(crate) fn cancel_during(mut self, phase: Phase, token: CancelToken) -> Self {
        self.cancel_during = Some((phase, token));
        self
    }

    pub(crate) fn summary_ping(mut self, ping: Option<f64>) -> Self {
        self.summary_ping = ping;
        self
    }

    pub(crate) fn phase_delay(mut self, delay: Duration) -> Self {
        self.phase_delay = delay;
        self
    }

    pub(crate) fn calls(&self) -> Vec<Phase> {
        self.calls.lock().unwrap().clone()
    }

    async fn enter(&self, phase: Phase) -> Result<()> {
        self.calls.lock().unwrap().push(phase);
        if !self.phase_delay.is_zero() {
            tokio::time::sleep(self.phase_delay).await;
        }
        if let Some((at, token)) = &self.cancel_during {
            if *at == phase {
                token.set();
            }
        }
        if self.fail_at == Some(phase) {
            bail!("scripted {} failure", phase);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl SpeedProbe for ScriptedProbe {
    async fn best_server(&self) -> Result<ServerInfo> {
        self.enter(Phase::ServerSelection).await?;
        Ok(self.server.clone())
    }

    async fn download(&self, _server: &ServerInfo) -> Result<f64> {
        self.enter(Phase::Download).await?;
        Ok(self.download_bps)
    }

    async fn upload(&self, _server: &ServerInfo) -> Result<f64> {
        self.enter(Phase::Upload).await?;
        Ok(self.upload_bps)
    }

    async fn summary(&self, _server: &ServerInfo) -> ProbeSummary {
        ProbeSummary {
            ping_ms: self.summary_ping,
        }
    }
}
