//! Error types for kiln

use thiserror::Error;

use crate::frame::{FrameId, WorkerId};

/// Result type alias using kiln's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for kiln operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The coordinator could not be reached
    #[error("connection to coordinator failed: {0}")]
    Connection(String),

    /// A request to the coordinator timed out
    #[error("request to coordinator timed out: {0}")]
    Timeout(String),

    /// The coordinator answered with an unexpected status
    #[error("coordinator returned {status} for {operation}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },

    /// Any other transport failure
    #[error("transport error: {0}")]
    Transport(String),

    /// A submission acknowledgment named a different worker
    #[error("protocol violation: coordinator acknowledged worker {actual}, session is {expected}")]
    WorkerIdMismatch { expected: WorkerId, actual: WorkerId },

    /// The coordinator sent something this worker cannot accept
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The render engine failed to produce a frame
    #[error("rendering frame {frame_id} failed: {message}")]
    Execution { frame_id: FrameId, message: String },

    /// Render engine setup failed (devices, binaries)
    #[error("render engine error: {0}")]
    Engine(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// The worker was asked to stop
    #[error("worker cancelled")]
    Cancelled,

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is worth retrying.
    ///
    /// Timeouts, refused connections and 5xx answers are transient. Malformed
    /// responses, 4xx answers and protocol violations are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connection(_) | Error::Timeout(_) => true,
            Error::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Check if this error means client and coordinator disagree about state
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Error::WorkerIdMismatch { .. } | Error::Protocol(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Error::Deserialization(err.to_string())
        } else {
            Error::Serialization(err.to_string())
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Configuration(format!("failed to parse config: {}", err))
    }
}
