//! Kiln Telemetry - Observability layer
//!
//! Structured logging for the kiln worker: subscriber setup with
//! environment-based filtering, log-context spans for workers and frames, and
//! event macros for the frame lifecycle.

pub mod logging;

pub use logging::{init_logging, FrameLogContext, LogFormat, LoggingConfig, WorkerLogContext};

use thiserror::Error;

/// Telemetry errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Logging error: {0}")]
    Logging(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;
