//! Periodic executor - background worker that runs maintenance reapers
//!
//! Every pass invokes each registered [`Reaper`] in registration order. A
//! reaper that fails or panics is logged and skipped; the remaining reapers
//! of the pass still run.

use crate::error::{DriverError, DriverResult};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default time between two passes.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// A maintenance task run on every pass of a [`PeriodicExecutor`].
#[async_trait]
pub trait Reaper: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self) -> DriverResult<()>;
}

/// A reaper that failed during a pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ReaperFailure {
    pub reaper: String,
    pub reason: String,
}

struct Worker {
    handle: JoinHandle<()>,
    shutdown: CancellationToken,
}

pub struct PeriodicExecutor {
    reapers: Arc<[Arc<dyn Reaper>]>,
    interval: Duration,
    worker: Mutex<Option<Worker>>,
}

impl PeriodicExecutor {
    /// Create an executor over a fixed list of reapers.
    pub fn new(reapers: Vec<Arc<dyn Reaper>>) -> Self {
        Self {
            reapers: reapers.into(),
            interval: DEFAULT_INTERVAL,
            worker: Mutex::new(None),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Launch the background worker. Returns false, leaving the running
    /// worker untouched, if one is already active. Fails with a
    /// configuration error when called outside a Tokio runtime.
    pub fn start(&self) -> DriverResult<bool> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            DriverError::Configuration(format!("Periodic executor needs a Tokio runtime: {}", e))
        })?;

        let mut worker = self.worker.lock();
        if let Some(current) = worker.as_ref() {
            if !current.handle.is_finished() {
                return Ok(false);
            }
        }

        let shutdown = CancellationToken::new();
        let handle = runtime.spawn(run_worker(
            self.reapers.clone(),
            self.interval,
            shutdown.clone(),
        ));
        *worker = Some(Worker { handle, shutdown });
        Ok(true)
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    /// Signal the worker to stop and wait for it to exit.
    ///
    /// The worker checks the signal between reapers and while sleeping, so a
    /// reaper is never interrupted halfway through.
    pub async fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        worker.shutdown.cancel();
        if let Err(e) = worker.handle.await {
            tracing::error!("Periodic executor worker failed: {}", e);
        }
        tracing::debug!("Periodic executor stopped");
    }

    /// Run one pass over every reaper right now.
    pub async fn execute(&self) -> Vec<ReaperFailure> {
        run_pass(&self.reapers, None).await
    }
}

impl Drop for PeriodicExecutor {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.shutdown.cancel();
        }
    }
}

async fn run_worker(
    reapers: Arc<[Arc<dyn Reaper>]>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    tracing::info!(
        "Starting periodic executor ({} reapers, interval: {:?})",
        reapers.len(),
        interval
    );
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        run_pass(&reapers, Some(&shutdown)).await;
    }
}

async fn run_pass(
    reapers: &[Arc<dyn Reaper>],
    shutdown: Option<&CancellationToken>,
) -> Vec<ReaperFailure> {
    let mut failures = Vec::new();

    for reaper in reapers {
        if shutdown.is_some_and(|s| s.is_cancelled()) {
            break;
        }

        let outcome = AssertUnwindSafe(reaper.execute()).catch_unwind().await;
        let reason = match outcome {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => {
                tracing::warn!("Reaper {} failed: {}", reaper.name(), e);
                e.to_string()
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                tracing::error!("Reaper {} panicked: {}", reaper.name(), reason);
                reason
            }
        };
        failures.push(ReaperFailure {
            reaper: reaper.name().to_string(),
            reason,
        });
    }

    failures
}
