//! Kiln Worker - Render farm worker client
//!
//! This crate provides the worker process for a kiln render farm:
//! - Registration and lease management against the coordinator
//! - Periodic heartbeats that keep the lease alive
//! - LIFO work queue fed by the coordinator's grants
//! - Frame rendering through a pluggable engine
//! - Submission with worker identity validation

pub mod client;
pub mod controller;
pub mod engine;
pub mod heartbeat;
pub mod queue;
pub mod retry;
pub mod session;
pub mod shutdown;
pub mod stats;

pub use client::{fetch_project_to, Coordinator, HttpCoordinator, Submission};
pub use controller::{apply_receipt, ControllerSettings, WorkerController};
pub use engine::{BlenderEngine, DeviceDescriptor, RenderEngine};
pub use heartbeat::{HeartbeatHandle, HeartbeatScheduler};
pub use queue::WorkQueue;
pub use retry::RetryPolicy;
pub use session::LeaseSession;
pub use shutdown::install_shutdown_handler;
pub use stats::{RunSummary, WorkerStats};
