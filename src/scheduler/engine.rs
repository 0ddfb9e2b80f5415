use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, error, info};

use super::{ErrorObserver, SchedulerError, Shared};

/// Scheduler execution loop for one generation.
///
/// Exits at the first check after `stop` or a restart; a failed or
/// panicking tick is counted and reported, then the loop sleeps again.
pub(crate) async fn run_scheduler_loop<F, Fut>(
    shared: Arc<Shared>,
    generation: u64,
    interval: Duration,
    on_tick: F,
    on_error: Option<ErrorObserver>,
) where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    info!(generation, interval_secs = interval.as_secs_f64(), "scheduler loop started");

    while shared.is_current(generation) {
        tokio::time::sleep(interval).await;
        if !shared.is_current(generation) {
            break;
        }

        let tick = shared.ticks.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(generation, tick, "tick");

        let outcome = AssertUnwindSafe(async { on_tick().await }).catch_unwind().await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(SchedulerError::Callback(format!("{e:#}"))),
            Err(payload) => Some(SchedulerError::Panicked(panic_message(payload.as_ref()))),
        };

        if let Some(err) = failure {
            shared.failures.fetch_add(1, Ordering::AcqRel);
            error!(generation, tick, error = %err, "scheduled tick failed, continuing");
            if let Some(observer) = &on_error {
                observer(&err);
            }
        }
    }

    info!(generation, "scheduler loop exited");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
