//! Lease keep-alive
//!
//! The heartbeat runs beside the main loop for as long as the worker holds a
//! lease. It never touches the work queue and never fails the worker: a missed
//! heartbeat is logged and retried on the next tick, and the coordinator
//! decides what a lapsed lease means.

use kiln_core::config::validate_heartbeat_period;
use kiln_core::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::Coordinator;
use crate::session::LeaseSession;
use crate::stats::WorkerStats;

/// Periodically extends the lease held by a session
pub struct HeartbeatScheduler {
    coordinator: Arc<dyn Coordinator>,
    session: Arc<LeaseSession>,
    period: Duration,
    stats: Arc<WorkerStats>,
}

impl HeartbeatScheduler {
    /// Create a scheduler; the period must be shorter than the session's lease
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        session: Arc<LeaseSession>,
        period: Duration,
    ) -> Result<Self> {
        validate_heartbeat_period(period, session.lease_duration())?;

        Ok(Self {
            coordinator,
            session,
            period,
            stats: Arc::new(WorkerStats::new()),
        })
    }

    /// Record heartbeat outcomes into shared counters
    pub fn with_stats(mut self, stats: Arc<WorkerStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Start heartbeating in the background until `cancel` fires
    pub fn spawn(self, cancel: CancellationToken) -> HeartbeatHandle {
        let token = cancel.clone();
        let task = tokio::spawn(async move { self.run(token).await });

        HeartbeatHandle { cancel, task }
    }

    /// Sleep one period, send one heartbeat, repeat until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        let worker_id = self.session.worker_id();
        let mut ticker = tokio::time::interval_at(Instant::now() + self.period, self.period);
        // A slow heartbeat pushes the schedule back instead of bursting to catch up.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(worker_id = %worker_id, "Heartbeat started, period {:?}", self.period);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.coordinator.heartbeat(worker_id) => result,
            };

            match result {
                Ok(()) => {
                    self.stats.record_heartbeat();
                    debug!(worker_id = %worker_id, "Lease extended");
                }
                Err(e) => {
                    self.stats.record_heartbeat_failure();
                    kiln_telemetry::log_heartbeat_failed!(worker_id, e);
                }
            }
        }

        debug!(worker_id = %worker_id, "Heartbeat stopped");
    }
}

/// Handle to a running heartbeat
#[derive(Debug)]
pub struct HeartbeatHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Whether the background task has ended
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the heartbeat and wait for it to wind down
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!("Heartbeat task ended abnormally: {}", e);
        }
    }
}
