//! Recurring measurement scheduler.
//!
//! One background tokio task per started schedule sleeps for the interval,
//! then awaits the tick callback before sleeping again, so ticks never
//! overlap. `stop` only flips a flag: a sleeping loop notices on wake-up and
//! a tick already running finishes.

mod engine;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("scheduled tick failed: {0}")]
    Callback(String),

    #[error("scheduled tick panicked: {0}")]
    Panicked(String),

    #[error("interval must be a positive, finite number of seconds")]
    InvalidInterval,
}

/// Callback notified of every failed tick.
pub type ErrorObserver = Arc<dyn Fn(&SchedulerError) + Send + Sync>;

/// Snapshot of the scheduler for display.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SchedulerState {
    pub running: bool,
    pub interval_secs: f64,
    pub ticks: u64,
    pub failures: u64,
}

/// Convert user-supplied seconds into a tick interval.
pub fn interval_from_secs(secs: f64) -> Result<Duration, SchedulerError> {
    match Duration::try_from_secs_f64(secs) {
        Ok(d) if !d.is_zero() => Ok(d),
        _ => Err(SchedulerError::InvalidInterval),
    }
}

/// Flags shared between the handle and its loop task.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    running: AtomicBool,
    generation: AtomicU64,
    ticks: AtomicU64,
    failures: AtomicU64,
}

impl Shared {
    /// A loop keeps going only while running and not superseded.
    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.running.load(Ordering::Acquire) && self.generation.load(Ordering::Acquire) == generation
    }
}

struct Control {
    interval: Duration,
    handle: Option<JoinHandle<()>>,
}

pub struct RecurringScheduler {
    shared: Arc<Shared>,
    control: Mutex<Control>,
    on_error: Option<ErrorObserver>,
}

impl Default for RecurringScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl RecurringScheduler {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            control: Mutex::new(Control {
                interval: Duration::ZERO,
                handle: None,
            }),
            on_error: None,
        }
    }

    /// Report failed ticks to `observer` in addition to the log.
    pub fn with_error_observer(mut self, observer: ErrorObserver) -> Self {
        self.on_error = Some(observer);
        self
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start ticking every `interval`. Must be called inside a tokio runtime.
    ///
    /// Returns `Ok(false)` without spawning anything if already running.
    pub fn start<F, Fut>(&self, interval: Duration, on_tick: F) -> Result<bool, SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if interval.is_zero() {
            return Err(SchedulerError::InvalidInterval);
        }

        let mut control = self.control();
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("scheduler already running, start ignored");
            return Ok(false);
        }
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;

        control.interval = interval;
        control.handle = Some(tokio::spawn(engine::run_scheduler_loop(
            self.shared.clone(),
            generation,
            interval,
            on_tick,
            self.on_error.clone(),
        )));
        Ok(true)
    }

    /// Stop scheduling. At most one tick that already passed its check may
    /// still complete after this returns.
    pub fn stop(&self) {
        let _control = self.control();
        if self.shared.running.swap(false, Ordering::AcqRel) {
            self.shared.generation.fetch_add(1, Ordering::AcqRel);
            tracing::info!("scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SchedulerState {
        let control = self.control();
        SchedulerState {
            running: self.is_running(),
            interval_secs: control.interval.as_secs_f64(),
            ticks: self.shared.ticks.load(Ordering::Acquire),
            failures: self.shared.failures.load(Ordering::Acquire),
        }
    }
}

/// Dropping the scheduler also aborts its loop task, so a sleeping loop does
/// not keep the tick closure alive until its next wake-up.
impl Drop for RecurringScheduler {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.control().handle.take() {
            handle.abort();
        }
    }
}
