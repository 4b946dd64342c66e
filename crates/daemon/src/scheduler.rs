//! Sync scheduler that runs sync cycles on a configurable interval and
//! supports signal-triggered immediate syncs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use shelfsync_core::errors::SyncError;
use shelfsync_core::sync_engine::SyncEngine;

/// Tracks aggregate statistics across sync cycles.
#[derive(Default)]
pub struct SchedulerStats {
    pub total_cycles: AtomicU64,
    pub skipped_offline: AtomicU64,
    pub total_conflicts: AtomicU64,
    pub total_pushed: AtomicU64,
    pub total_applied: AtomicU64,
    pub total_errors: AtomicU64,
    pub consecutive_errors: AtomicU64,
    pub maintenance_runs: AtomicU64,
}

/// The sync scheduler.
///
/// Runs a cycle on every tick and on every manual request. Ticks while the
/// remote is unreachable are skipped without touching any table state.
pub struct Scheduler {
    engine: SyncEngine,
    poll_interval: Duration,
    maintenance_every: u64,
    sync_rx: mpsc::Receiver<()>,
    stats: Arc<SchedulerStats>,
}

impl Scheduler {
    pub fn new(engine: SyncEngine, poll_interval: Duration, sync_rx: mpsc::Receiver<()>) -> Self {
        let maintenance_every = engine.config().audit.dedup_every_cycles;
        Self {
            engine,
            poll_interval,
            maintenance_every,
            sync_rx,
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.stats.clone()
    }

    /// Main scheduler loop. Returns once `shutdown` is notified.
    pub async fn run(&mut self, shutdown: Arc<Notify>) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            maintenance_every = self.maintenance_every,
            "scheduler started"
        );

        let mut interval = time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("scheduler shutting down");
                    break;
                }
                // The first tick completes immediately: sync once at startup.
                _ = interval.tick() => {
                    self.maybe_run_cycle("scheduled").await;
                }
                Some(()) = self.sync_rx.recv() => {
                    self.maybe_run_cycle("manual").await;
                    interval.reset();
                }
            }
        }
    }

    /// Run one cycle unless the remote is unreachable or a cycle is
    /// already in progress.
    pub async fn maybe_run_cycle(&self, trigger: &str) {
        if !self.engine.check_connectivity().await {
            let skipped = self.stats.skipped_offline.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(trigger, skipped, "remote unreachable, skipping sync cycle");
            return;
        }

        let cycle_num = self.stats.total_cycles.load(Ordering::SeqCst) + 1;
        info!(cycle = cycle_num, trigger, "starting sync cycle");

        let report = match self.engine.run_cycle().await {
            Ok(report) => report,
            Err(SyncError::AlreadyRunning { started_at }) => {
                warn!(trigger, %started_at, "skipping sync cycle: previous cycle still running");
                return;
            }
            Err(e) => {
                self.stats.total_errors.fetch_add(1, Ordering::SeqCst);
                error!(cycle = cycle_num, error = %e, "sync cycle failed");
                return;
            }
        };
        self.stats.total_cycles.fetch_add(1, Ordering::SeqCst);

        let (mut pushed, mut applied, mut conflicts) = (0u64, 0u64, 0u64);
        for outcome in &report.outcomes {
            pushed += outcome.pushed as u64;
            applied += outcome.applied as u64;
            conflicts += outcome.conflicts as u64;
        }
        self.stats.total_pushed.fetch_add(pushed, Ordering::SeqCst);
        self.stats.total_applied.fetch_add(applied, Ordering::SeqCst);
        self.stats.total_conflicts.fetch_add(conflicts, Ordering::SeqCst);

        let failed = report.failed_tables();
        if failed.is_empty() {
            self.stats.consecutive_errors.store(0, Ordering::SeqCst);
            info!(
                cycle = cycle_num,
                pushed,
                applied,
                conflicts,
                "sync cycle completed successfully"
            );
        } else {
            let errors = self.stats.total_errors.fetch_add(1, Ordering::SeqCst) + 1;
            let consecutive = self.stats.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
            for outcome in report.outcomes.iter().filter(|o| o.is_failed()) {
                warn!(
                    cycle = cycle_num,
                    table = %outcome.table,
                    error = outcome.error.as_deref().unwrap_or("unknown"),
                    "table failed to sync"
                );
            }
            error!(
                cycle = cycle_num,
                failed_tables = failed.len(),
                total_errors = errors,
                consecutive_errors = consecutive,
                "sync cycle completed with failures"
            );
        }

        if self.maintenance_every > 0 && cycle_num % self.maintenance_every == 0 {
            self.run_maintenance().await;
        }
    }

    async fn run_maintenance(&self) {
        match self.engine.run_audit_maintenance().await {
            Ok(report) => {
                self.stats.maintenance_runs.fetch_add(1, Ordering::SeqCst);
                info!(
                    collapsed = report.collapsed,
                    forwarded = report.forwarded,
                    remote_cleaned = report.remote_cleaned,
                    "audit maintenance complete"
                );
            }
            Err(e) => warn!(error = %e, "audit maintenance failed"),
        }
    }
}
