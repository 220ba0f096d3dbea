//! Fixed-interval runner that never lets two runs of a job overlap.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::dispatcher::Dispatcher;
use crate::error::DispatchError;
use crate::messaging::Publisher;

#[async_trait]
pub trait ScheduledJob: Send + 'static {
    fn name(&self) -> &'static str;

    /// One run. Must return promptly once `cancel` fires.
    async fn execute(&mut self, cancel: &CancellationToken);

    /// Called once after the last run has finished.
    async fn shutdown(&mut self) {}
}

#[async_trait]
impl<P: Publisher + 'static> ScheduledJob for Dispatcher<P> {
    fn name(&self) -> &'static str {
        "process-outbox-messages"
    }

    async fn execute(&mut self, cancel: &CancellationToken) {
        match self.dispatch(cancel).await {
            Ok(_) => {}
            Err(DispatchError::Cancelled) => {
                info!("Outbox dispatch cancelled by shutdown");
            }
            Err(e) => {
                error!("Error during outbox dispatch: {}", e);
            }
        }
    }

    async fn shutdown(&mut self) {
        self.close().await;
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub started: u64,
    pub skipped: u64,
}

/// Runs `job` every `interval` until `shutdown` is cancelled.
///
/// Each tick tries to take the job's lock. If the previous run still holds
/// it the tick is skipped, never queued. On shutdown the in-flight run (which
/// sees the same token) is awaited before `ScheduledJob::shutdown` is called.
pub async fn run<J: ScheduledJob>(job: J, interval: Duration, shutdown: CancellationToken) -> SchedulerStats {
    let name = job.name();
    let job = Arc::new(Mutex::new(job));
    let mut stats = SchedulerStats::default();

    info!(job = name, interval_ms = interval.as_millis() as u64, "Starting scheduler...");
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                break;
            }
            _ = ticker.tick() => {
                match Arc::clone(&job).try_lock_owned() {
                    Ok(mut guard) => {
                        stats.started += 1;
                        let cancel = shutdown.clone();
                        tokio::spawn(async move {
                            guard.execute(&cancel).await;
                        });
                    }
                    Err(_) => {
                        stats.skipped += 1;
                        debug!(job = name, "Previous run still in progress; skipping tick");
                    }
                }
            }
        }
    }

    info!(job = name, "Waiting for in-flight run to complete...");
    job.lock().await.shutdown().await;
    info!(job = name, started = stats.started, skipped = stats.skipped, "Scheduler stopped.");

    stats
}
