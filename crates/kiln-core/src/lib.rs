//! Kiln Core - Core types for the kiln render worker
//!
//! This crate provides the building blocks shared by the worker and its tests:
//! - Frame and worker identifiers and the frame lifecycle
//! - Wire types for the coordinator protocol
//! - Configuration structures
//! - Error types

pub mod config;
pub mod error;
pub mod frame;
pub mod protocol;

pub use config::{HeartbeatConfig, KilnConfig, RetryConfig, WorkerConfig};
pub use error::{Error, Result};
pub use frame::{FrameId, FrameRecord, FrameState, WorkerId};
pub use protocol::{LeaseGrant, RegisterRequest, SubmitReceipt};
