//! Lease session established at registration

use chrono::{DateTime, Utc};
use kiln_core::{FrameId, LeaseGrant, Result, WorkerId};
use std::time::Duration;

/// Identity and lease terms handed out by the coordinator.
///
/// Only constructible from a validated [`LeaseGrant`], and immutable after
/// that, so a worker id exists before anything can reference it and never
/// changes afterwards. Shared with the heartbeat behind an `Arc`.
#[derive(Debug, Clone)]
pub struct LeaseSession {
    worker_id: WorkerId,
    lease_duration: Duration,
    registered_at: DateTime<Utc>,
}

impl LeaseSession {
    /// Open a session from a registration answer, returning the initial frames
    pub fn from_grant(grant: LeaseGrant) -> Result<(Self, Vec<FrameId>)> {
        grant.validate()?;

        let session = Self {
            lease_duration: grant.lease_duration(),
            worker_id: grant.worker_id,
            registered_at: Utc::now(),
        };

        Ok((session, grant.frames))
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    /// Whether `other` names this session's worker
    pub fn is_same_worker(&self, other: &WorkerId) -> bool {
        &self.worker_id == other
    }
}
