//! Wire types exchanged with the coordinator
//!
//! Bodies are JSON. The worker identity never appears in a request body; it
//! travels in the [`HEADER_WORKER_ID`] header so the coordinator can
//! authenticate a call before parsing its payload.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::frame::{FrameId, WorkerId};

/// Header carrying the worker identity on heartbeat and submit calls
pub const HEADER_WORKER_ID: &str = "x-worker-id";

/// Header carrying the per-submission idempotency key
pub const HEADER_IDEMPOTENCY_KEY: &str = "x-idempotency-key";

/// `GET` - download the project file
pub const PATH_PROJECT: &str = "/frames";

/// `POST` registers, `PUT` submits a rendered frame
pub const PATH_TASKS: &str = "/tasks";

/// `POST` - extend the lease
pub const PATH_HEARTBEAT: &str = "/workers/alive";

/// Multipart field holding the frame id on submit
pub const FIELD_FRAME_ID: &str = "frame_id";

/// Multipart field holding the artifact bytes on submit
pub const FIELD_FRAME: &str = "frame";

/// Body of the registration call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// How many frames to lease
    pub count: u32,
}

/// Registration answer: identity, lease length and the first frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseGrant {
    pub worker_id: WorkerId,

    /// Seconds the lease stays valid without a heartbeat
    pub lease_time: u64,

    #[serde(default)]
    pub frames: Vec<FrameId>,
}

impl LeaseGrant {
    /// Lease length as a duration
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_time)
    }

    /// Reject grants no worker could honour
    pub fn validate(&self) -> crate::Result<()> {
        if self.worker_id.as_str().is_empty() {
            return Err(crate::Error::Protocol(
                "registration returned an empty worker id".to_string(),
            ));
        }
        if self.lease_time == 0 {
            return Err(crate::Error::Protocol(
                "registration returned a zero-length lease".to_string(),
            ));
        }
        Ok(())
    }
}

/// Submission acknowledgment: who was acknowledged, and the replacement frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub worker_id: WorkerId,

    #[serde(default)]
    pub frames: Vec<FrameId>,
}

impl SubmitReceipt {
    /// An acknowledgment that grants nothing further
    pub fn exhausted(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            frames: Vec::new(),
        }
    }

    /// Whether the coordinator has run out of frames for this worker
    pub fn is_exhausted(&self) -> bool {
        self.frames.is_empty()
    }
}
