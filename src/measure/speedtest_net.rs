//! HTTP speed test probe against speedtest.net-style servers.
//!
//! Servers expose `latency.txt`, `random{N}x{N}.jpg` images and an
//! `upload.php` sink next to each other; throughput is bytes moved over
//! wall-clock time across a bounded set of concurrent transfers.
//!
//! Only the three phase calls touch the network. `summary` reports the
//! fastest round trip recorded for the selected server during selection.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use super::{ProbeSummary, ServerInfo, SpeedProbe};
use crate::config::ProbeConfig;

#[derive(Debug, Error)]
pub enum SpeedtestNetError {
    #[error("server list is empty")]
    NoServers,

    #[error("none of {tried} candidate servers answered a latency probe")]
    NoReachableServer { tried: usize },

    #[error("{direction} moved no data")]
    EmptyTransfer { direction: &'static str },

    #[error("server url has no path component: {url}")]
    InvalidServerUrl { url: String },

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Entry of the JSON server list. Numeric fields arrive as strings or
/// numbers depending on the endpoint, so only the ones we need are read.
#[derive(Debug, Clone, Deserialize)]
struct ServerListEntry {
    url: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    country: String,
    #[serde(default)]
    sponsor: String,
    #[serde(default, deserialize_with = "string_or_number")]
    id: String,
    #[serde(default)]
    host: String,
}

fn string_or_number<'de, D>(de: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v = serde_json::Value::deserialize(de)?;
    Ok(match v {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

pub struct SpeedtestNetProbe {
    client: Client,
    config: ProbeConfig,
    /// Upload URL of the last selected server and its fastest latency sample.
    selection_rtt: Mutex<Option<(String, f64)>>,
}

impl SpeedtestNetProbe {
    pub fn new(config: ProbeConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(SpeedtestNetError::from)?;
        Ok(Self {
            client,
            config,
            selection_rtt: Mutex::new(None),
        })
    }

    fn remember_rtt(&self, url: &str, rtt_ms: Option<f64>) {
        let mut slot = self
            .selection_rtt
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = rtt_ms.map(|rtt| (url.to_string(), rtt));
    }

    fn recorded_rtt(&self, url: &str) -> Option<f64> {
        let slot = self
            .selection_rtt
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some((selected, rtt)) if selected == url => Some(*rtt),
            _ => None,
        }
    }

    async fn fetch_servers(&self) -> Result<Vec<ServerListEntry>, SpeedtestNetError> {
        let servers: Vec<ServerListEntry> = self
            .client
            .get(&self.config.servers_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!(count = servers.len(), "fetched server list");
        Ok(servers)
    }

    /// Round-trip times in ms for `latency.txt`; failed samples are dropped.
    async fn sample_latency(&self, base: &str) -> Vec<f64> {
        let mut samples = Vec::with_capacity(self.config.latency_samples);
        for _ in 0..self.config.latency_samples.max(1) {
            let url = format!("{}/latency.txt?x={}", base, nonce());
            let start = Instant::now();
            let res = self
                .client
                .get(&url)
                .send()
                .await
                .and_then(|r| r.error_for_status());
            match res {
                Ok(_) => samples.push(start.elapsed().as_secs_f64() * 1000.0),
                Err(e) => debug!(%url, error = %e, "latency sample failed"),
            }
        }
        samples
    }

    /// Stream a GET body to completion, returning the byte count.
    async fn fetch_counting(&self, url: String) -> Result<u64, SpeedtestNetError> {
        let mut resp = self.client.get(&url).send().await?.error_for_status()?;
        let mut total = 0u64;
        while let Some(chunk) = resp.chunk().await? {
            total += chunk.len() as u64;
        }
        Ok(total)
    }

    async fn post_counting(&self, url: String, payload: Bytes) -> Result<u64, SpeedtestNetError> {
        let len = payload.len() as u64;
        self.client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(len)
    }
}

#[async_trait::async_trait]
impl SpeedProbe for SpeedtestNetProbe {
    async fn best_server(&self) -> Result<ServerInfo> {
        let servers = self.fetch_servers().await?;
        if servers.is_empty() {
            return Err(SpeedtestNetError::NoServers.into());
        }

        let candidates: Vec<ServerListEntry> = servers
            .into_iter()
            .take(self.config.candidate_limit.max(1))
            .collect();
        let tried = candidates.len();

        let measured: Vec<((ServerListEntry, Option<f64>), Option<f64>)> = stream::iter(candidates)
            .map(|entry| async move {
                let samples = match server_base(&entry.url) {
                    Ok(base) => self.sample_latency(base).await,
                    Err(e) => {
                        warn!(error = %e, "skipping candidate");
                        Vec::new()
                    }
                };
                let fastest = fastest(&samples);
                ((entry, fastest), mean(&samples))
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let ((entry, fastest_ms), latency_ms) =
            pick_lowest_latency(measured).ok_or(SpeedtestNetError::NoReachableServer { tried })?;
        self.remember_rtt(&entry.url, fastest_ms);

        Ok(ServerInfo {
            id: entry.id,
            sponsor: entry.sponsor,
            name: entry.name,
            country: entry.country,
            host: entry.host,
            url: entry.url,
            latency_ms,
        })
    }

    async fn download(&self, server: &ServerInfo) -> Result<f64> {
        let base = server_base(&server.url)?;
        let urls: Vec<String> = self
            .config
            .download_sizes
            .iter()
            .flat_map(|size| std::iter::repeat(*size).take(self.config.download_repeats.max(1)))
            .map(|size| format!("{}/random{}x{}.jpg?x={}", base, size, size, nonce()))
            .collect();

        let start = Instant::now();
        let results: Vec<Result<u64, SpeedtestNetError>> = stream::iter(urls)
            .map(|url| self.fetch_counting(url))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        let elapsed = start.elapsed();

        let total = sum_transfers(results, "download")?;
        debug!(bytes = total, elapsed_ms = elapsed.as_millis() as u64, "download complete");
        Ok(bits_per_second(total, elapsed))
    }

    async fn upload(&self, server: &ServerInfo) -> Result<f64> {
        let payloads: Vec<Bytes> = self
            .config
            .upload_sizes_kb
            .iter()
            .map(|kb| random_payload(kb * 1024))
            .collect();
        let jobs: Vec<Bytes> = payloads
            .iter()
            .flat_map(|p| std::iter::repeat(p.clone()).take(self.config.upload_repeats.max(1)))
            .collect();

        let start = Instant::now();
        let results: Vec<Result<u64, SpeedtestNetError>> = stream::iter(jobs)
            .map(|payload| self.post_counting(server.url.clone(), payload))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        let elapsed = start.elapsed();

        let total = sum_transfers(results, "upload")?;
        debug!(bytes = total, elapsed_ms = elapsed.as_millis() as u64, "upload complete");
        Ok(bits_per_second(total, elapsed))
    }

    /// Fastest selection-time sample for `server`; no network I/O.
    async fn summary(&self, server: &ServerInfo) -> ProbeSummary {
        ProbeSummary {
            ping_ms: self.recorded_rtt(&server.url),
        }
    }
}

/// Strip the final path segment (`upload.php`) from a server URL.
fn server_base(url: &str) -> Result<&str, SpeedtestNetError> {
    match url.rsplit_once('/') {
        Some((base, _)) if base.contains("://") && !base.ends_with('/') => Ok(base),
        _ => Err(SpeedtestNetError::InvalidServerUrl {
            url: url.to_string(),
        }),
    }
}

fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        None
    } else {
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }
}

fn fastest(samples: &[f64]) -> Option<f64> {
    samples.iter().copied().min_by(|a, b| a.total_cmp(b))
}

fn pick_lowest_latency<T>(measured: Vec<(T, Option<f64>)>) -> Option<(T, f64)> {
    measured
        .into_iter()
        .filter_map(|(entry, latency)| latency.map(|l| (entry, l)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
}

/// Add up successful transfers; individual failures are tolerated as long
/// as something got through.
fn sum_transfers(
    results: Vec<Result<u64, SpeedtestNetError>>,
    direction: &'static str,
) -> Result<u64, SpeedtestNetError> {
    let mut total = 0u64;
    let mut last_err = None;
    for r in results {
        match r {
            Ok(n) => total += n,
            Err(e) => {
                warn!(%direction, error = %e, "transfer failed");
                last_err = Some(e);
            }
        }
    }
    match (total, last_err) {
        (0, Some(e)) => Err(e),
        (0, None) => Err(SpeedtestNetError::EmptyTransfer { direction }),
        (n, _) => Ok(n),
    }
}

fn bits_per_second(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    bytes as f64 * 8.0 / secs
}

fn random_payload(len: usize) -> Bytes {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill(&mut buf[..]);
    Bytes::from(buf)
}

/// Cache buster appended to every request.
fn nonce() -> u32 {
    rand::random()
}
