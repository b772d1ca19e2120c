//! Frame and worker identifiers, and the lifecycle of a leased frame

use serde::{Deserialize, Deserializer, Serialize};

/// Identifier of one frame (the unit of work)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(pub u64);

impl FrameId {
    /// Get the numeric value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for FrameId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Opaque worker identity assigned by the coordinator at registration.
///
/// Coordinators hand these out either as strings or as bare numbers, so
/// deserialization accepts both and normalises to a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    /// Get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for WorkerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl<'de> Deserialize<'de> for WorkerId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => Ok(WorkerId(s)),
            Raw::Number(n) => Ok(WorkerId(n.to_string())),
        }
    }
}

/// Where a frame is in its lifecycle on this worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameState {
    /// Waiting in the local work queue
    Pending,
    /// Being rendered by the engine
    Executing,
    /// Artifact sent to the coordinator, acknowledgment outstanding
    Submitted,
    /// Coordinator accepted the artifact
    Acknowledged,
    /// Rendering or submission failed
    Failed,
}

impl FrameState {
    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, FrameState::Acknowledged | FrameState::Failed)
    }

    /// Check whether moving to `next` is a legal transition
    pub fn can_advance_to(&self, next: FrameState) -> bool {
        use FrameState::*;

        matches!(
            (self, next),
            (Pending, Executing)
                | (Executing, Submitted)
                | (Submitted, Acknowledged)
                | (Executing, Failed)
                | (Submitted, Failed)
        )
    }
}

impl std::fmt::Display for FrameState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameState::Pending => write!(f, "pending"),
            FrameState::Executing => write!(f, "executing"),
            FrameState::Submitted => write!(f, "submitted"),
            FrameState::Acknowledged => write!(f, "acknowledged"),
            FrameState::Failed => write!(f, "failed"),
        }
    }
}

/// A frame that has left the queue, tracked through to acknowledgment
#[derive(Debug, Clone)]
pub struct FrameRecord {
    pub id: FrameId,
    pub state: FrameState,
}

impl FrameRecord {
    /// Start tracking a freshly dequeued frame
    pub fn dequeued(id: FrameId) -> Self {
        Self {
            id,
            state: FrameState::Pending,
        }
    }

    /// Move to the next state, rejecting transitions the lifecycle forbids
    pub fn advance(&mut self, next: FrameState) -> crate::Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(crate::Error::Internal(format!(
                "frame {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }
}
