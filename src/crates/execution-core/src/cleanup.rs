//! C6 — Cleanup Service: a periodic reaper that bounds how much execution
//! history accumulates in durable storage.
//!
//! Follows a connection-pool-style stale reap (retain past `max_age`, report
//! what was dropped), generalized with a count-based excess pass since
//! execution history additionally bounds by total row count, not just age.

use crate::execution_store::ExecutionView;
use crate::service::ExecutionService;
use std::time::Duration;
use tokio::task::JoinHandle;

/// One pass over the execution store: dispose of anything past `max_age`,
/// then, if still over `max_executions`, dispose of the oldest terminal
/// executions until under the limit. Live (non-terminal) executions are
/// never reaped regardless of age.
pub struct CleanupService {
    service: ExecutionService,
    max_age: Duration,
    max_executions: usize,
}

/// What one tick actually did, for logging and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub reaped_by_age: usize,
    pub reaped_by_excess: usize,
    pub failures: usize,
}

impl CleanupService {
    pub fn new(service: ExecutionService, max_age: Duration, max_executions: usize) -> Self {
        Self { service, max_age, max_executions }
    }

    /// Run one reaping pass now.
    pub async fn tick(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        let now = chrono::Utc::now();
        let store = self.service.execution_store();

        let Ok(mut views) = store.list().await else {
            return report;
        };
        // `list()` already sorts newest-first; reap oldest-first.
        views.reverse();

        let mut survivors: Vec<ExecutionView> = Vec::with_capacity(views.len());
        for view in views {
            let terminal = view.status().is_terminal();
            let age = now.signed_duration_since(view.created_at());
            if terminal && age.to_std().map(|d| d > self.max_age).unwrap_or(false) {
                match self.service.dispose(view.id()).await {
                    Ok(()) => report.reaped_by_age += 1,
                    Err(err) => {
                        tracing::warn!(execution_id = view.id(), error = %err, "failed to reap aged execution");
                        report.failures += 1;
                        survivors.push(view);
                    }
                }
            } else {
                survivors.push(view);
            }
        }

        if survivors.len() > self.max_executions {
            let excess = survivors.len() - self.max_executions;
            // Oldest-first among remaining terminal executions only; live
            // executions are never counted against the cap.
            let mut reaped = 0;
            for view in survivors.iter() {
                if reaped >= excess {
                    break;
                }
                if !view.status().is_terminal() {
                    continue;
                }
                match self.service.dispose(view.id()).await {
                    Ok(()) => {
                        report.reaped_by_excess += 1;
                        reaped += 1;
                    }
                    Err(err) => {
                        tracing::warn!(execution_id = view.id(), error = %err, "failed to reap excess execution");
                        report.failures += 1;
                    }
                }
            }
        }

        report
    }

    /// Spawn a background task that calls [`Self::tick`] every `interval`
    /// until the returned handle is aborted or dropped.
    pub fn spawn_periodic(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let report = self.tick().await;
                if report.reaped_by_age > 0 || report.reaped_by_excess > 0 || report.failures > 0 {
                    tracing::info!(
                        reaped_by_age = report.reaped_by_age,
                        reaped_by_excess = report.reaped_by_excess,
                        failures = report.failures,
                        "cleanup tick complete"
                    );
                }
            }
        })
    }
}
