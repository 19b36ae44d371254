//! Periodic sync with exponential backoff.

use crate::job::SyncJob;
use facegraph_core::config::JobConfig;
use facegraph_core::types::SyncStatus;
use facegraph_core::CancelFlag;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Delay before the next run after `retry_count` consecutive unproductive
/// runs: `interval · multiplier^retry_count`, capped at `max_interval`.
pub fn backoff_interval(config: &JobConfig, retry_count: u32) -> Duration {
    let base = config.interval().as_secs_f64();
    let max = config.max_interval().as_secs_f64();
    let factor = (config.backoff_multiplier as f64).powi(retry_count.min(64) as i32);
    Duration::from_secs_f64((base * factor).min(max).max(0.0))
}

struct Timer {
    task: JoinHandle<()>,
    stop: CancelFlag,
    wake: Arc<Notify>,
}

/// Drives a [`SyncJob`] on a timer until stopped.
pub struct SyncScheduler {
    job: Arc<SyncJob>,
    timer: Mutex<Option<Timer>>,
}

impl SyncScheduler {
    pub fn new(job: Arc<SyncJob>) -> Self {
        Self {
            job,
            timer: Mutex::new(None),
        }
    }

    pub fn job(&self) -> &Arc<SyncJob> {
        &self.job
    }

    /// Whether a timer is armed or a scheduled run is in progress.
    pub fn is_scheduled(&self) -> bool {
        self.timer
            .lock()
            .map(|t| t.as_ref().is_some_and(|t| !t.task.is_finished()))
            .unwrap_or(false)
    }

    /// Arm the timer. The first run waits the backoff delay for the persisted
    /// retry count; every completed run re-arms it until [`stop_sync`]
    /// is called or a run pauses. Calling this while armed is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// [`stop_sync`]: SyncScheduler::stop_sync
    pub fn schedule_next_sync(&self) {
        let Ok(mut timer) = self.timer.lock() else {
            tracing::error!("scheduler lock poisoned");
            return;
        };
        if timer.as_ref().is_some_and(|t| !t.task.is_finished()) {
            tracing::debug!("sync already scheduled");
            return;
        }

        let stop = CancelFlag::new();
        let wake = Arc::new(Notify::new());
        let task = tokio::spawn(run_loop(self.job.clone(), stop.clone(), wake.clone()));
        *timer = Some(Timer { task, stop, wake });
    }

    /// Disarm the timer and ask a run in progress to pause after its current
    /// file.
    pub fn stop_sync(&self) {
        let Ok(mut timer) = self.timer.lock() else {
            tracing::error!("scheduler lock poisoned");
            return;
        };
        if let Some(t) = timer.take() {
            t.stop.cancel();
            t.wake.notify_one();
            tracing::info!("sync stopped");
        }
    }
}

async fn run_loop(job: Arc<SyncJob>, stop: CancelFlag, wake: Arc<Notify>) {
    let config = job.config().job.clone();
    loop {
        let retry_count = match job.store().sync_state() {
            Ok(state) => state.retry_count,
            Err(e) => {
                tracing::error!(error = %e, "cannot read sync state, scheduler exiting");
                return;
            }
        };
        let delay = backoff_interval(&config, retry_count);
        tracing::debug!(?delay, retry_count, "next sync scheduled");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wake.notified() => {}
        }
        if stop.is_cancelled() {
            return;
        }

        match job.run(&stop).await {
            Ok(outcome) if outcome.status == SyncStatus::Paused => return,
            Ok(outcome) => {
                tracing::debug!(processed = outcome.processed, failed = outcome.failed, "scheduled sync finished");
            }
            Err(e) => {
                tracing::warn!(error = %e, "scheduled sync failed, backing off");
            }
        }
    }
}
