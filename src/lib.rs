//! speedwatch -- internet speed test with history and recurring measurement.
//!
//! This crate provides the measurement orchestrator (server selection,
//! download and upload saturation with cooperative cancellation), a
//! recurring scheduler, a bounded result history, CSV export and an HTTP API
//! over all of it.

pub mod api;
pub mod config;
pub mod export;
pub mod history;
pub mod measure;
pub mod report;
pub mod scheduler;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::SpeedwatchConfig;
use crate::measure::speedtest_net::SpeedtestNetProbe;
use crate::session::Session;

/// Build a session backed by the speedtest.net HTTP probe.
pub fn build_session(config: &SpeedwatchConfig) -> Result<Session> {
    let probe = SpeedtestNetProbe::new(config.probe.clone()).context("Failed to build HTTP probe")?;
    Ok(Session::new(Arc::new(probe), config.history.capacity))
}

/// Serve the HTTP API for `session` until Ctrl-C.
pub async fn serve(bind: &str, session: Session, default_interval: Duration) -> Result<()> {
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("Invalid bind address '{}'", bind))?;
    let app = api::router(api::state::AppState::new(session.clone(), default_interval));

    tracing::info!(%addr, "speedwatch API listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    session.stop_schedule();
    session.cancel();
    Ok(())
}
