//! Local queue of leased frames

use kiln_core::FrameId;
use std::collections::HashSet;
use tracing::warn;

/// Frames leased to this worker and not yet picked up.
///
/// Last in, first out: the most recently granted frame is rendered next.
/// Owned by the controller's main loop only; the heartbeat never sees it.
#[derive(Debug, Default)]
pub struct WorkQueue {
    pending: Vec<FrameId>,
    index: HashSet<FrameId>,
}

impl WorkQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a granted frame. Returns false if it is already pending.
    pub fn push(&mut self, frame: FrameId) -> bool {
        if !self.index.insert(frame) {
            warn!(
                frame_id = %frame,
                "Coordinator granted a frame that is already queued, ignoring"
            );
            return false;
        }
        self.pending.push(frame);
        true
    }

    /// Enqueue every granted frame, returning how many were accepted
    pub fn extend(&mut self, frames: impl IntoIterator<Item = FrameId>) -> usize {
        frames.into_iter().filter(|frame| self.push(*frame)).count()
    }

    /// Take the next frame to render
    pub fn pop(&mut self) -> Option<FrameId> {
        let frame = self.pending.pop()?;
        self.index.remove(&frame);
        Some(frame)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Pending frames, oldest first
    pub fn pending(&self) -> &[FrameId] {
        &self.pending
    }
}

impl FromIterator<FrameId> for WorkQueue {
    fn from_iter<I: IntoIterator<Item = FrameId>>(iter: I) -> Self {
        let mut queue = WorkQueue::new();
        queue.extend(iter);
        queue
    }
}
