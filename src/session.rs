//! Application-facing facade: one probe, one history, one scheduler.
//!
//! Front ends never call the orchestrator directly. They go through a
//! [`Session`], which guards against overlapping runs, owns the cancel token
//! of the run in flight and fans progress out over a broadcast channel so
//! each receiver can marshal events onto its own context.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::export::{self, ExportError};
use crate::history::History;
use crate::measure::{
    run_measurement, CancelToken, HistoryEntry, MeasurementOutcome, Phase, ProbeError, SpeedProbe,
};
use crate::scheduler::{RecurringScheduler, SchedulerError, SchedulerState};

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Speed test already running.")]
    AlreadyRunning,

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// What the session is doing right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running { phase: Option<Phase> },
    Stopping,
    Completed { timestamp: String },
    Cancelled,
    Failed { phase: Phase, message: String },
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Idle => write!(f, "Ready"),
            RunState::Running { phase: None } => write!(f, "Starting test..."),
            RunState::Running { phase: Some(p) } => write!(f, "{}", p.status_label()),
            RunState::Stopping => write!(f, "Stopping..."),
            RunState::Completed { timestamp } => write!(f, "Completed: {}", timestamp),
            RunState::Cancelled => write!(f, "Stopped"),
            RunState::Failed { phase, message } => write!(f, "Error during {}: {}", phase, message),
        }
    }
}

/// Progress and outcome notifications.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Started { run_id: Uuid },
    Status { run_id: Uuid, phase: Phase },
    Completed { run_id: Uuid, result: HistoryEntry },
    Cancelled { run_id: Uuid },
    Failed { run_id: Uuid, phase: Phase, message: String },
    ScheduleError { message: String },
}

struct Inner {
    probe: Arc<dyn SpeedProbe>,
    history: History,
    run_lock: Arc<tokio::sync::Mutex<()>>,
    current: Mutex<Option<CancelToken>>,
    state: Mutex<RunState>,
    events: broadcast::Sender<SessionEvent>,
    scheduler: RecurringScheduler,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn set_state(&self, state: RunState) {
        *lock(&self.state) = state;
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn run_locked(&self, _guard: OwnedMutexGuard<()>) -> Result<MeasurementOutcome, SessionError> {
        let run_id = Uuid::new_v4();
        let token = CancelToken::new();
        *lock(&self.current) = Some(token.clone());
        let mut in_flight = InFlight {
            inner: self,
            run_id,
            finished: false,
        };
        self.set_state(RunState::Running { phase: None });
        self.emit(SessionEvent::Started { run_id });
        info!(%run_id, "measurement started");

        let result = run_measurement(self.probe.as_ref(), &token, |phase| {
            info!(%run_id, %phase, "{}", phase.status_label());
            self.set_state(RunState::Running { phase: Some(phase) });
            self.emit(SessionEvent::Status { run_id, phase });
        })
        .instrument(info_span!("measurement", %run_id))
        .await;

        in_flight.finished = true;
        *lock(&self.current) = None;

        match &result {
            Ok(MeasurementOutcome::Completed(r)) => {
                self.history.add(r.clone());
                info!(
                    %run_id,
                    download_mbps = r.download_mbps(),
                    upload_mbps = r.upload_mbps(),
                    ping_ms = r.ping_ms(),
                    server = r.server(),
                    "measurement completed"
                );
                self.set_state(RunState::Completed {
                    timestamp: r.timestamp().to_string(),
                });
                self.emit(SessionEvent::Completed {
                    run_id,
                    result: r.clone(),
                });
            }
            Ok(MeasurementOutcome::Cancelled) => {
                info!(%run_id, "measurement cancelled");
                self.set_state(RunState::Cancelled);
                self.emit(SessionEvent::Cancelled { run_id });
            }
            Err(e) => {
                warn!(%run_id, phase = %e.phase, error = %e, "measurement failed");
                let message = format!("{:#}", e.source);
                self.set_state(RunState::Failed {
                    phase: e.phase,
                    message: message.clone(),
                });
                self.emit(SessionEvent::Failed {
                    run_id,
                    phase: e.phase,
                    message,
                });
            }
        }

        result.map_err(SessionError::from)
    }
}

/// Clears the current run if its future is dropped before finishing,
/// e.g. under `tokio::time::timeout`.
struct InFlight<'a> {
    inner: &'a Inner,
    run_id: Uuid,
    finished: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        *lock(&self.inner.current) = None;
        self.inner.set_state(RunState::Cancelled);
        self.inner.emit(SessionEvent::Cancelled { run_id: self.run_id });
        warn!(run_id = %self.run_id, "measurement dropped before finishing");
    }
}

/// Cloneable handle; clones share the same probe, history and scheduler.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    pub fn new(probe: Arc<dyn SpeedProbe>, history_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let observer_tx = events.clone();
        let scheduler = RecurringScheduler::new().with_error_observer(Arc::new(move |e| {
            let _ = observer_tx.send(SessionEvent::ScheduleError {
                message: e.to_string(),
            });
        }));

        Self {
            inner: Arc::new(Inner {
                probe,
                history: History::new(history_capacity),
                run_lock: Arc::new(tokio::sync::Mutex::new(())),
                current: Mutex::new(None),
                state: Mutex::new(RunState::Idle),
                events,
                scheduler,
            }),
        }
    }

    fn acquire(&self) -> Result<OwnedMutexGuard<()>, SessionError> {
        self.inner
            .run_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| SessionError::AlreadyRunning)
    }

    /// Run one measurement and wait for it. Successful results are added
    /// to history before this returns.
    pub async fn measure_once(&self) -> Result<MeasurementOutcome, SessionError> {
        let guard = self.acquire()?;
        self.inner.run_locked(guard).await
    }

    /// Start a measurement in the background.
    pub fn start_measurement(
        &self,
    ) -> Result<JoinHandle<Result<MeasurementOutcome, SessionError>>, SessionError> {
        let guard = self.acquire()?;
        let inner = self.inner.clone();
        Ok(tokio::spawn(async move { inner.run_locked(guard).await }))
    }

    /// Ask the run in flight to stop at its next phase boundary.
    /// Returns false when nothing is running.
    pub fn cancel(&self) -> bool {
        let current = lock(&self.inner.current);
        match current.as_ref() {
            Some(token) => {
                token.set();
                self.inner.set_state(RunState::Stopping);
                info!("cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.current).is_some()
    }

    pub fn status(&self) -> RunState {
        lock(&self.inner.state).clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.inner.history.get_all()
    }

    pub fn latest(&self) -> Option<HistoryEntry> {
        self.inner.history.latest()
    }

    pub fn history_capacity(&self) -> usize {
        self.inner.history.capacity()
    }

    /// Drop all stored results and reset the displayed state.
    pub fn clear_history(&self) {
        self.inner.history.clear();
        if !self.is_running() {
            self.inner.set_state(RunState::Idle);
        }
    }

    /// Export the current history, newest first. Returns the row count.
    pub fn export_csv(&self, path: &Path) -> Result<usize, SessionError> {
        let entries = self.inner.history.get_all();
        export::export_csv(path, &entries)?;
        Ok(entries.len())
    }

    /// Re-run the measurement every `interval`. A tick that finds a manual
    /// run in flight is skipped.
    pub fn start_schedule(&self, interval: Duration) -> Result<bool, SessionError> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let started = self.inner.scheduler.start(interval, move || {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return Ok(());
                };
                let Ok(guard) = inner.run_lock.clone().try_lock_owned() else {
                    info!("measurement already running, skipping scheduled tick");
                    return Ok(());
                };
                match inner.run_locked(guard).await {
                    Ok(_) => Ok(()),
                    Err(e) => Err(anyhow::Error::new(e)),
                }
            }
        })?;
        if started {
            info!(interval_secs = interval.as_secs_f64(), "schedule started");
        }
        Ok(started)
    }

    pub fn stop_schedule(&self) {
        self.inner.scheduler.stop();
    }

    pub fn schedule_state(&self) -> SchedulerState {
        self.inner.scheduler.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measure::testing::ScriptedProbe;

    fn session(probe: ScriptedProbe) -> Session {
        Session::new(Arc::new(probe), 50)
    }

    #[tokio::test]
    async fn test_completed_run_lands_in_history() {
        let session = session(ScriptedProbe::new());
        let mut events = session.subscribe();

        let outcome = session.measure_once().await.unwrap();
        let result = outcome.into_result().unwrap();

        assert_eq!(session.history(), vec![result.clone()]);
        assert_eq!(session.latest(), Some(result.clone()));
        assert_eq!(
            session.status(),
            RunState::Completed {
                timestamp: result.timestamp().to_string()
            }
        );

        let mut kinds = Vec::new();
        while let Ok(ev) = events.try_recv() {
            kinds.push(ev);
        }
        assert_eq!(kinds.len(), 5);
        assert!(matches!(kinds[0], SessionEvent::Started { .. }));
        assert!(matches!(kinds[1], SessionEvent::Status { phase: Phase::ServerSelection, .. }));
        assert!(matches!(kinds[2], SessionEvent::Status { phase: Phase::Download, .. }));
        assert!(matches!(kinds[3], SessionEvent::Status { phase: Phase::Upload, .. }));
        assert!(matches!(kinds[4], SessionEvent::Completed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_download_records_nothing() {
        let session = session(ScriptedProbe::new().phase_delay(Duration::from_secs(2)));
        let mut events = session.subscribe();
        let handle = session.start_measurement().unwrap();

        // Cancel once the download phase has begun; it still runs to the boundary.
        loop {
            if let SessionEvent::Status { phase: Phase::Download, .. } = events.recv().await.unwrap() {
                assert!(session.cancel());
                break;
            }
        }

        let outcome = handle.await.unwrap().unwrap();
        assert!(outcome.is_cancelled());
        assert!(session.history().is_empty());
        assert_eq!(session.status(), RunState::Cancelled);
        assert!(!session.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_run_rejected() {
        let session = session(ScriptedProbe::new().phase_delay(Duration::from_secs(1)));
        let handle = session.start_measurement().unwrap();

        let err = session.measure_once().await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyRunning));

        handle.await.unwrap().unwrap();
        assert_eq!(session.history().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_run_leaves_session_idle() {
        let session = session(ScriptedProbe::new().phase_delay(Duration::from_secs(10)));
        let mut events = session.subscribe();

        let timed_out = tokio::time::timeout(Duration::from_secs(5), session.measure_once()).await;
        assert!(timed_out.is_err());

        assert!(!session.is_running());
        assert_eq!(session.status(), RunState::Cancelled);
        assert!(!session.cancel());
        assert_eq!(session.status(), RunState::Cancelled);
        assert!(session.history().is_empty());

        let mut last = None;
        while let Ok(ev) = events.try_recv() {
            last = Some(ev);
        }
        assert!(matches!(last, Some(SessionEvent::Cancelled { .. })));

        // The run guard was released too.
        session.clear_history();
        assert_eq!(session.status(), RunState::Idle);
        let handle = session.start_measurement().unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(handle.await.unwrap().unwrap().into_result().is_some());
    }

    #[tokio::test]
    async fn test_failure_keeps_history_untouched() {
        let session = session(ScriptedProbe::new().fail_at(Phase::Download));
        let err = session.measure_once().await.unwrap_err();

        let SessionError::Probe(probe_err) = err else {
            panic!("expected probe error");
        };
        assert_eq!(probe_err.phase, Phase::Download);
        assert!(session.history().is_empty());
        assert!(matches!(
            session.status(),
            RunState::Failed { phase: Phase::Download, .. }
        ));
    }

    #[tokio::test]
    async fn test_cancel_without_run_is_noop() {
        let session = session(ScriptedProbe::new());
        assert!(!session.cancel());
        assert_eq!(session.status(), RunState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_fills_history() {
        let session = session(ScriptedProbe::new());
        assert!(session.start_schedule(Duration::from_secs(60)).unwrap());
        assert!(!session.start_schedule(Duration::from_secs(60)).unwrap());

        tokio::time::sleep(Duration::from_secs(150)).await;
        session.stop_schedule();

        assert_eq!(session.history().len(), 2);
        let state = session.schedule_state();
        assert!(!state.running);
        assert_eq!(state.ticks, 2);
        assert_eq!(state.interval_secs, 60.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_failures_are_reported_as_events() {
        let session = session(ScriptedProbe::new().fail_at(Phase::ServerSelection));
        let mut events = session.subscribe();
        session.start_schedule(Duration::from_secs(10)).unwrap();

        tokio::time::sleep(Duration::from_secs(25)).await;
        session.stop_schedule();

        assert_eq!(session.schedule_state().failures, 2);
        let mut schedule_errors = 0;
        while let Ok(ev) = events.try_recv() {
            if let SessionEvent::ScheduleError { message } = ev {
                assert!(message.contains("server selection failed"));
                schedule_errors += 1;
            }
        }
        assert_eq!(schedule_errors, 2);
    }

    #[tokio::test]
    async fn test_export_and_clear() {
        let session = session(ScriptedProbe::new());
        session.measure_once().await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        assert_eq!(session.export_csv(&path).unwrap(), 1);

        let bad = dir.path().join("nope").join("out.csv");
        assert!(matches!(session.export_csv(&bad), Err(SessionError::Export(_))));
        assert_eq!(session.history().len(), 1);

        session.clear_history();
        assert!(session.history().is_empty());
        assert_eq!(session.status(), RunState::Idle);
    }
}
