//! Periodic driver for reconciliation passes.
//!
//! `start` spawns a cancellable interval task; `tick` runs exactly one pass
//! and is what the task calls on every interval. Tests and the HTTP trigger
//! call `tick` directly instead of waiting on the clock.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use flume::Sender;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::reconcile::{PassReport, ReconciliationEngine};

#[derive(Debug, Clone)]
pub enum WatchEvent {
    PassStarted,
    PassCompleted(PassReport),
    PassFailed(String),
}

pub struct ReconcileScheduler {
    engine: Arc<ReconciliationEngine>,
    interval: Duration,
    run_on_startup: bool,
    event_tx: Sender<WatchEvent>,
}

/// Handle to a running scheduler task.
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop scheduling new passes and wait for the task to exit.
    /// A pass already in progress is allowed to finish.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.task.await.context("scheduler task panicked")?;
        tracing::info!("Reconciliation scheduler stopped");
        Ok(())
    }
}

impl ReconcileScheduler {
    pub fn new(
        engine: Arc<ReconciliationEngine>,
        interval: Duration,
        run_on_startup: bool,
        event_tx: Sender<WatchEvent>,
    ) -> Self {
        Self {
            engine,
            interval,
            run_on_startup,
            event_tx,
        }
    }

    /// Run one reconciliation pass and publish its outcome.
    pub async fn tick(&self) -> Result<PassReport> {
        self.emit(WatchEvent::PassStarted);
        match self.engine.run_pass().await {
            Ok(report) => {
                self.emit(WatchEvent::PassCompleted(report.clone()));
                Ok(report)
            }
            Err(e) => {
                tracing::error!("Reconciliation pass aborted: {:#}", e);
                self.emit(WatchEvent::PassFailed(format!("{:#}", e)));
                Err(e)
            }
        }
    }

    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let scheduler = self;

        let task = tokio::spawn(async move {
            let period = scheduler.interval.max(Duration::from_secs(1));
            tracing::info!(
                "Reconciliation scheduler started (every {}s, run_on_startup={})",
                period.as_secs(),
                scheduler.run_on_startup
            );

            let mut ticker = tokio::time::interval(period);
            // Passes are never queued up behind a slow one.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            if !scheduler.run_on_startup {
                // The first tick of an interval completes immediately.
                ticker.tick().await;
            }

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // Failures are already logged and published; keep ticking.
                        let _ = scheduler.tick().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        SchedulerHandle { shutdown_tx, task }
    }

    fn emit(&self, event: WatchEvent) {
        if self.event_tx.send(event).is_err() {
            tracing::debug!("No listener for scheduler events");
        }
    }
}
