//! Common test utilities and fixtures

use async_trait::async_trait;
use kiln_core::{Error, FrameId, LeaseGrant, Result, SubmitReceipt, WorkerId};
use kiln_worker::engine::{DeviceDescriptor, RenderEngine};
use kiln_worker::{Coordinator, Submission};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize test environment (logging, etc.)
pub fn init() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("kiln_worker=debug")
            .try_init();
    });
}

/// A lease grant as the coordinator would send it
pub fn grant(worker_id: &str, lease_time: u64, frames: &[u64]) -> LeaseGrant {
    LeaseGrant {
        worker_id: WorkerId::from(worker_id),
        lease_time,
        frames: frames.iter().copied().map(FrameId).collect(),
    }
}

/// A submission receipt as the coordinator would send it
pub fn receipt(worker_id: &str, frames: &[u64]) -> SubmitReceipt {
    SubmitReceipt {
        worker_id: WorkerId::from(worker_id),
        frames: frames.iter().copied().map(FrameId).collect(),
    }
}

/// Something the worker asked of the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    FetchProject,
    Register(u32),
    Heartbeat(WorkerId),
    Submit {
        worker_id: WorkerId,
        frame_id: FrameId,
        idempotency_key: Uuid,
    },
}

#[derive(Default)]
struct Script {
    register: VecDeque<Result<Option<LeaseGrant>>>,
    submit: VecDeque<Result<SubmitReceipt>>,
    heartbeat: VecDeque<Result<()>>,
    calls: Vec<(Instant, Call)>,
}

/// In-memory coordinator replaying scripted responses in order.
///
/// Heartbeats succeed once their script runs out; registrations and
/// submissions beyond the script fail with an internal error.
#[derive(Clone, Default)]
pub struct ScriptedCoordinator {
    script: Arc<Mutex<Script>>,
}

impl ScriptedCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_register(self, response: Result<Option<LeaseGrant>>) -> Self {
        self.script.lock().unwrap().register.push_back(response);
        self
    }

    pub fn on_submit(self, response: Result<SubmitReceipt>) -> Self {
        self.script.lock().unwrap().submit.push_back(response);
        self
    }

    pub fn on_heartbeat(self, response: Result<()>) -> Self {
        self.script.lock().unwrap().heartbeat.push_back(response);
        self
    }

    /// Every call received, in order
    pub fn calls(&self) -> Vec<Call> {
        self.script
            .lock()
            .unwrap()
            .calls
            .iter()
            .map(|(_, call)| call.clone())
            .collect()
    }

    /// When each heartbeat arrived
    pub fn heartbeat_times(&self) -> Vec<Instant> {
        self.script
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(_, call)| matches!(call, Call::Heartbeat(_)))
            .map(|(at, _)| *at)
            .collect()
    }

    pub fn submitted_frames(&self) -> Vec<FrameId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Submit { frame_id, .. } => Some(frame_id),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.script
            .lock()
            .unwrap()
            .calls
            .push((Instant::now(), call));
    }
}

#[async_trait]
impl Coordinator for ScriptedCoordinator {
    async fn fetch_project(&self) -> Result<Vec<u8>> {
        self.record(Call::FetchProject);
        Ok(b"BLENDER-v300".to_vec())
    }

    async fn register(&self, count: u32) -> Result<Option<LeaseGrant>> {
        self.record(Call::Register(count));
        self.script
            .lock()
            .unwrap()
            .register
            .pop_front()
            .unwrap_or_else(|| Err(Error::Internal("unscripted register".into())))
    }

    async fn heartbeat(&self, worker_id: &WorkerId) -> Result<()> {
        self.record(Call::Heartbeat(worker_id.clone()));
        self.script
            .lock()
            .unwrap()
            .heartbeat
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn submit(&self, worker_id: &WorkerId, submission: &Submission) -> Result<SubmitReceipt> {
        self.record(Call::Submit {
            worker_id: worker_id.clone(),
            frame_id: submission.frame_id,
            idempotency_key: submission.idempotency_key,
        });
        self.script
            .lock()
            .unwrap()
            .submit
            .pop_front()
            .unwrap_or_else(|| Err(Error::Internal("unscripted submit".into())))
    }
}

struct EngineState {
    dir: TempDir,
    render_time: Duration,
    fail_on: Option<FrameId>,
    executed: Mutex<Vec<FrameId>>,
    artifacts: Mutex<Vec<PathBuf>>,
}

/// Engine that writes a small file per frame instead of rendering
#[derive(Clone)]
pub struct ScriptedEngine {
    state: Arc<EngineState>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::build(Duration::ZERO, None)
    }

    /// Each frame takes `render_time` of (tokio) time
    pub fn with_render_time(render_time: Duration) -> Self {
        Self::build(render_time, None)
    }

    /// Rendering `frame` fails
    pub fn failing_on(frame: u64) -> Self {
        Self::build(Duration::ZERO, Some(FrameId(frame)))
    }

    fn build(render_time: Duration, fail_on: Option<FrameId>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self {
            state: Arc::new(EngineState {
                dir,
                render_time,
                fail_on,
                executed: Mutex::new(Vec::new()),
                artifacts: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Frames executed, in order
    pub fn executed(&self) -> Vec<FrameId> {
        self.state.executed.lock().unwrap().clone()
    }

    /// Paths of every artifact produced
    pub fn artifacts(&self) -> Vec<PathBuf> {
        self.state.artifacts.lock().unwrap().clone()
    }
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RenderEngine for ScriptedEngine {
    async fn configure(&mut self, _device: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(vec![DeviceDescriptor {
            kind: "CPU".to_string(),
            name: "scripted".to_string(),
        }])
    }

    async fn select_all_devices_for_compute(&mut self) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, frame: FrameId) -> Result<PathBuf> {
        self.state.executed.lock().unwrap().push(frame);

        if !self.state.render_time.is_zero() {
            tokio::time::sleep(self.state.render_time).await;
        }

        if self.state.fail_on == Some(frame) {
            return Err(Error::Execution {
                frame_id: frame,
                message: "render exited with status 1".to_string(),
            });
        }

        let path = self.state.dir.path().join(format!("frame_{:05}.png", frame.get()));
        std::fs::write(&path, format!("frame {}", frame))?;
        self.state.artifacts.lock().unwrap().push(path.clone());
        Ok(path)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
