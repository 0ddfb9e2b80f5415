//! Runs one full measurement: select server, download, upload.
//!
//! Cancellation is checked only at phase boundaries. A phase already in
//! flight (e.g. a download saturation call) runs to completion, so stop
//! latency is bounded by the slowest single phase.

use chrono::Local;
use tracing::{debug, info};

use super::{
    bps_to_mbps, CancelToken, MeasurementOutcome, MeasurementResult, Phase, ProbeError,
    SpeedProbe, TIMESTAMP_FORMAT,
};

/// Run one measurement against `probe`.
///
/// `on_status` is invoked once per phase, in order, before that phase's
/// network call. Returns `Ok(Cancelled)` if `cancel` was set at any boundary.
pub async fn run_measurement<P, F>(
    probe: &P,
    cancel: &CancelToken,
    on_status: F,
) -> Result<MeasurementOutcome, ProbeError>
where
    P: SpeedProbe + ?Sized,
    F: Fn(Phase) + Send + Sync,
{
    if cancel.is_set() {
        debug!("cancelled before server selection");
        return Ok(MeasurementOutcome::Cancelled);
    }

    on_status(Phase::ServerSelection);
    let server = probe
        .best_server()
        .await
        .map_err(|e| ProbeError::new(Phase::ServerSelection, e))?;
    if cancel.is_set() {
        return Ok(MeasurementOutcome::Cancelled);
    }
    let server_name = server.display_name();
    let selection_ping = server.latency_ms;
    info!(server = %server_name, latency_ms = selection_ping, "selected server");

    on_status(Phase::Download);
    let download_bps = probe
        .download(&server)
        .await
        .map_err(|e| ProbeError::new(Phase::Download, e))?;
    if cancel.is_set() {
        return Ok(MeasurementOutcome::Cancelled);
    }
    debug!(download_bps, "download finished");

    on_status(Phase::Upload);
    let upload_bps = probe
        .upload(&server)
        .await
        .map_err(|e| ProbeError::new(Phase::Upload, e))?;
    if cancel.is_set() {
        return Ok(MeasurementOutcome::Cancelled);
    }
    debug!(upload_bps, "upload finished");

    // Prefer the post-test ping; fall back to the selection estimate.
    let summary = probe.summary(&server).await;
    let ping_ms = summary.ping_ms.unwrap_or(selection_ping);

    let timestamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
    Ok(MeasurementOutcome::Completed(MeasurementResult::new(
        server_name,
        bps_to_mbps(download_bps),
        bps_to_mbps(upload_bps),
        ping_ms,
        timestamp,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measure::testing::ScriptedProbe;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_completed_run_emits_three_statuses_in_order() {
        let probe = ScriptedProbe::new();
        let cancel = CancelToken::new();
        let log = Mutex::new(Vec::new());

        let outcome = run_measurement(&probe, &cancel, |p| log.lock().unwrap().push(p))
            .await
            .unwrap();

        let labels: Vec<_> = log
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.status_label())
            .collect();
        assert_eq!(
            labels,
            vec!["Finding best server...", "Testing download...", "Testing upload..."]
        );

        let result = outcome.into_result().expect("completed");
        assert_eq!(result.server(), "Acme (NYC, US)");
        assert_eq!(result.download_mbps(), 93.456789);
        assert_eq!(result.upload_mbps(), 12.3);
        assert_eq!(result.timestamp().len(), 19);
    }

    #[tokio::test]
    async fn test_cancel_before_start_makes_no_calls() {
        let probe = ScriptedProbe::new();
        let cancel = CancelToken::new();
        cancel.set();
        let log = Mutex::new(Vec::new());

        let outcome = run_measurement(&probe, &cancel, |p| log.lock().unwrap().push(p))
            .await
            .unwrap();

        assert!(outcome.is_cancelled());
        assert!(log.lock().unwrap().is_empty());
        assert!(probe.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_server_selection() {
        let cancel = CancelToken::new();
        let probe = ScriptedProbe::new().cancel_during(Phase::ServerSelection, cancel.clone());

        let outcome = run_measurement(&probe, &cancel, |_| {}).await.unwrap();

        assert!(outcome.is_cancelled());
        assert_eq!(probe.calls(), vec![Phase::ServerSelection]);
    }

    #[tokio::test]
    async fn test_cancel_during_download_skips_upload() {
        let cancel = CancelToken::new();
        let probe = ScriptedProbe::new().cancel_during(Phase::Download, cancel.clone());
        let log = Mutex::new(Vec::new());

        let outcome = run_measurement(&probe, &cancel, |p| log.lock().unwrap().push(p))
            .await
            .unwrap();

        assert!(outcome.is_cancelled());
        assert_eq!(probe.calls(), vec![Phase::ServerSelection, Phase::Download]);
        assert_eq!(
            *log.lock().unwrap(),
            vec![Phase::ServerSelection, Phase::Download]
        );
    }

    #[tokio::test]
    async fn test_cancel_during_upload_discards_result() {
        let cancel = CancelToken::new();
        let probe = ScriptedProbe::new().cancel_during(Phase::Upload, cancel.clone());

        let outcome = run_measurement(&probe, &cancel, |_| {}).await.unwrap();

        assert!(outcome.is_cancelled());
        assert_eq!(probe.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_failure_is_tagged_with_phase() {
        let probe = ScriptedProbe::new().fail_at(Phase::Upload);
        let cancel = CancelToken::new();

        let err = run_measurement(&probe, &cancel, |_| {}).await.unwrap_err();

        assert_eq!(err.phase, Phase::Upload);
        assert!(err.to_string().starts_with("upload failed"));
    }

    #[tokio::test]
    async fn test_server_selection_failure_emits_one_status() {
        let probe = ScriptedProbe::new().fail_at(Phase::ServerSelection);
        let cancel = CancelToken::new();
        let log = Mutex::new(Vec::new());

        let err = run_measurement(&probe, &cancel, |p| log.lock().unwrap().push(p))
            .await
            .unwrap_err();

        assert_eq!(err.phase, Phase::ServerSelection);
        assert_eq!(*log.lock().unwrap(), vec![Phase::ServerSelection]);
    }

    #[tokio::test]
    async fn test_summary_ping_preferred() {
        let probe = ScriptedProbe::new().summary_ping(Some(9.5));
        let outcome = run_measurement(&probe, &CancelToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(outcome.into_result().unwrap().ping_ms(), 9.5);
    }

    #[tokio::test]
    async fn test_selection_latency_is_fallback_ping() {
        let probe = ScriptedProbe::new().summary_ping(None);
        let outcome = run_measurement(&probe, &CancelToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(outcome.into_result().unwrap().ping_ms(), 14.0);
    }
}
