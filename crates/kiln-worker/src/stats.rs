//! Worker counters

use chrono::{DateTime, Utc};
use kiln_core::WorkerId;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::session::LeaseSession;

/// Counters shared between the main loop and the heartbeat
#[derive(Debug, Default)]
pub struct WorkerStats {
    frames_rendered: AtomicU64,
    frames_submitted: AtomicU64,
    heartbeats_sent: AtomicU64,
    heartbeats_failed: AtomicU64,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_rendered(&self) {
        self.frames_rendered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_submitted(&self) {
        self.frames_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat_failure(&self) {
        self.heartbeats_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent.load(Ordering::Relaxed)
    }

    pub fn heartbeats_failed(&self) -> u64 {
        self.heartbeats_failed.load(Ordering::Relaxed)
    }

    /// Freeze the counters into a summary; `session` is `None` if no lease was granted
    pub fn summary(&self, session: Option<&LeaseSession>) -> RunSummary {
        RunSummary {
            worker_id: session.map(|s| s.worker_id().clone()),
            registered_at: session.map(LeaseSession::registered_at),
            frames_rendered: self.frames_rendered.load(Ordering::Relaxed),
            frames_submitted: self.frames_submitted.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent(),
            heartbeats_failed: self.heartbeats_failed(),
        }
    }
}

/// What a finished run accomplished
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Identity the coordinator assigned; `None` if no lease was granted
    pub worker_id: Option<WorkerId>,

    /// When the lease was granted
    pub registered_at: Option<DateTime<Utc>>,

    pub frames_rendered: u64,

    pub frames_submitted: u64,

    pub heartbeats_sent: u64,

    pub heartbeats_failed: u64,
}
