//! Worker controller
//!
//! Owns the worker's whole lifecycle:
//!
//! 1. Register with the coordinator, obtaining a [`LeaseSession`] and the
//!    first frames.
//! 2. Start the [`HeartbeatScheduler`] with the session it will keep alive.
//! 3. Pop a frame, render it, submit it, validate the receipt, queue the
//!    replacement frames, release the artifact. Repeat until the queue drains.
//! 4. Stop the heartbeat, whichever way the loop ended.
//!
//! Every failure on the main loop is fatal; only the heartbeat tolerates
//! errors.

use chrono::Utc;
use kiln_core::config::HeartbeatConfig;
use kiln_core::{
    Error, FrameId, FrameRecord, FrameState, KilnConfig, Result, SubmitReceipt, WorkerConfig,
};
use kiln_telemetry::{FrameLogContext, WorkerLogContext};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::client::{Coordinator, Submission};
use crate::engine::RenderEngine;
use crate::heartbeat::HeartbeatScheduler;
use crate::queue::WorkQueue;
use crate::retry::RetryPolicy;
use crate::session::LeaseSession;
use crate::stats::{RunSummary, WorkerStats};

/// Knobs the controller needs from the configuration
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Frames requested at registration
    pub batch_size: u32,

    pub heartbeat: HeartbeatConfig,

    pub register_retry: RetryPolicy,

    pub submit_retry: RetryPolicy,

    /// Keep rendered frames on disk after acknowledgment
    pub keep_artifacts: bool,
}

impl ControllerSettings {
    pub fn from_config(config: &KilnConfig) -> Self {
        Self {
            batch_size: config.worker.batch_size,
            heartbeat: config.heartbeat.clone(),
            register_retry: RetryPolicy::for_register(&config.retry),
            submit_retry: RetryPolicy::for_submit(&config.retry),
            keep_artifacts: config.worker.keep_artifacts,
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            batch_size: WorkerConfig::default().batch_size,
            heartbeat: HeartbeatConfig::default(),
            register_retry: RetryPolicy::never(),
            submit_retry: RetryPolicy::never(),
            keep_artifacts: false,
        }
    }
}

/// Drives registration, heartbeat and the render/submit loop
pub struct WorkerController {
    coordinator: Arc<dyn Coordinator>,
    engine: Box<dyn RenderEngine>,
    settings: ControllerSettings,
    cancel: CancellationToken,
    stats: Arc<WorkerStats>,
}

impl WorkerController {
    /// Create a controller around a coordinator and a configured engine
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        engine: Box<dyn RenderEngine>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            coordinator,
            engine,
            settings,
            cancel: CancellationToken::new(),
            stats: Arc::new(WorkerStats::new()),
        }
    }

    /// Stop the worker when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that stops the worker before its next frame
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Run until the coordinator runs out of frames or something fails
    pub async fn run(&self) -> Result<RunSummary> {
        let Some(grant) = self.register().await? else {
            info!("Coordinator has no frames to lease, nothing to do");
            return Ok(self.stats.summary(None));
        };

        let (session, frames) = LeaseSession::from_grant(grant)?;
        let session = Arc::new(session);
        let period = self.settings.heartbeat.period_for(session.lease_duration())?;
        let mut queue: WorkQueue = frames.into_iter().collect();

        let span = WorkerLogContext::new(
            session.worker_id().as_str(),
            session.lease_duration().as_secs(),
        )
        .span();

        info!(
            parent: &span,
            "Registered as worker {} with {} frames, lease {:?}, heartbeat every {:?}",
            session.worker_id(),
            queue.len(),
            session.lease_duration(),
            period
        );

        // The session is complete before the heartbeat exists, so it can only
        // ever see the assigned worker id.
        let heartbeat = HeartbeatScheduler::new(
            Arc::clone(&self.coordinator),
            Arc::clone(&session),
            period,
        )?
        .with_stats(Arc::clone(&self.stats))
        .spawn(self.cancel.child_token());

        let outcome = self.drain(&session, &mut queue).instrument(span.clone()).await;

        heartbeat.stop().await;

        let summary = self.stats.summary(Some(session.as_ref()));
        match outcome {
            Ok(()) => {
                info!(
                    parent: &span,
                    "Worker {} finished after {}s. Rendered: {}, Submitted: {}, \
                     Heartbeats: {} ({} failed)",
                    session.worker_id(),
                    (Utc::now() - session.registered_at()).num_seconds(),
                    summary.frames_rendered,
                    summary.frames_submitted,
                    summary.heartbeats_sent,
                    summary.heartbeats_failed
                );
                Ok(summary)
            }
            Err(e) => {
                error!(parent: &span, "Worker {} stopping: {}", session.worker_id(), e);
                Err(e)
            }
        }
    }

    async fn register(&self) -> Result<Option<kiln_core::LeaseGrant>> {
        let batch_size = self.settings.batch_size;
        debug!("Registering for {} frames", batch_size);

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = self
                .settings
                .register_retry
                .run("register", || self.coordinator.register(batch_size)) => result,
        }
    }

    /// Render and submit until the queue is empty
    async fn drain(&self, session: &LeaseSession, queue: &mut WorkQueue) -> Result<()> {
        while let Some(frame) = queue.pop() {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let mut record = FrameRecord::dequeued(frame);
            if let Err(e) = self.process(session, queue, &mut record).await {
                let stage = record.state;
                if record.advance(FrameState::Failed).is_ok() {
                    error!(frame_id = %frame, "Frame failed while {}", stage);
                }
                return Err(e);
            }
        }

        debug!("Work queue drained");
        Ok(())
    }

    /// Take one frame from Pending to Acknowledged
    async fn process(
        &self,
        session: &LeaseSession,
        queue: &mut WorkQueue,
        record: &mut FrameRecord,
    ) -> Result<()> {
        let frame = record.id;

        record.advance(FrameState::Executing)?;
        kiln_telemetry::log_frame_started!(frame);
        let started = Instant::now();

        let artifact = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            result = self.engine.execute(frame) => result?,
        };

        self.stats.record_rendered();
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        kiln_telemetry::log_frame_rendered!(frame, duration_ms);

        let submission = Submission::new(frame, artifact.clone());
        let span = FrameLogContext::new(frame.get())
            .with_idempotency_key(&submission.idempotency_key.to_string())
            .span();

        record.advance(FrameState::Submitted)?;
        let receipt = self
            .settings
            .submit_retry
            .run("submit", || {
                self.coordinator.submit(session.worker_id(), &submission)
            })
            .instrument(span)
            .await?;

        let granted = apply_receipt(session, queue, receipt)?;
        record.advance(FrameState::Acknowledged)?;
        self.stats.record_submitted();
        kiln_telemetry::log_frame_submitted!(frame, granted);

        self.release_artifact(frame, &artifact).await;
        Ok(())
    }

    async fn release_artifact(&self, frame: FrameId, artifact: &Path) {
        if self.settings.keep_artifacts {
            return;
        }
        if let Err(e) = tokio::fs::remove_file(artifact).await {
            warn!(
                frame_id = %frame,
                "Failed to remove {}: {}",
                artifact.display(),
                e
            );
        }
    }
}

/// Check a submission receipt against the session and queue what it grants.
///
/// A receipt for another worker is rejected before the queue is touched. An
/// empty grant is the coordinator's way of saying it has no more work; the
/// worker finishes whatever is still queued and stops.
pub fn apply_receipt(
    session: &LeaseSession,
    queue: &mut WorkQueue,
    receipt: SubmitReceipt,
) -> Result<usize> {
    if !session.is_same_worker(&receipt.worker_id) {
        return Err(Error::WorkerIdMismatch {
            expected: session.worker_id().clone(),
            actual: receipt.worker_id,
        });
    }

    if receipt.is_exhausted() {
        info!("Coordinator granted no further frames");
        return Ok(0);
    }

    Ok(queue.extend(receipt.frames))
}
