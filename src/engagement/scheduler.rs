//! Single-flight run tracking and the periodic sync loop.

use super::orchestrator::{SyncOrchestrator, SyncResult};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Remembers whether a sync is in flight and what the last one returned.
#[derive(Default)]
pub struct SyncTracker {
    running: AtomicBool,
    last_result: Mutex<Option<SyncResult>>,
}

/// Held for the duration of a run; dropping it clears the running flag.
pub struct RunGuard<'a> {
    tracker: &'a SyncTracker,
}

impl SyncTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the tracker, or `None` when another run holds it.
    pub fn try_start(&self) -> Option<RunGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard { tracker: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn last_result(&self) -> Option<SyncResult> {
        self.last_result.lock().clone()
    }
}

impl RunGuard<'_> {
    pub fn finish(self, result: SyncResult) {
        *self.tracker.last_result.lock() = Some(result);
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.tracker.running.store(false, Ordering::Release);
    }
}

/// Run a sync unless one is already in progress.
pub async fn run_tracked(
    orchestrator: &SyncOrchestrator,
    tracker: &SyncTracker,
) -> Option<SyncResult> {
    let guard = tracker.try_start()?;
    let result = orchestrator.run_sync().await;
    guard.finish(result.clone());
    Some(result)
}

/// Run the pipeline every `interval`. Never returns.
pub async fn run_scheduler(
    orchestrator: Arc<SyncOrchestrator>,
    tracker: Arc<SyncTracker>,
    interval: Duration,
) {
    log::info!(
        "engagement scheduler started, interval {}s",
        interval.as_secs()
    );

    loop {
        tokio::time::sleep(interval).await;

        match run_tracked(&orchestrator, &tracker).await {
            Some(result) if result.is_complete() => {
                log::info!("scheduled engagement sync updated {} subscribers", result.updated);
            }
            Some(result) => {
                log::warn!(
                    "scheduled engagement sync finished with {} issues",
                    result.issues.len()
                );
            }
            None => {
                log::info!("scheduled engagement sync skipped: a run is already in progress");
            }
        }
    }
}
