//! Structured logging for kiln
//!
//! Provides structured logging with:
//! - Configurable log levels
//! - Environment-based filtering
//! - Optional JSON output
//! - Worker/frame context injection

use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, time::UtcTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::{TelemetryError, TelemetryResult};

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Enable logging
    pub enabled: bool,

    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Output format (json, pretty, compact)
    pub format: LogFormat,

    /// Include span events
    pub include_spans: bool,

    /// Include file/line information
    pub include_location: bool,

    /// Include target (module path)
    pub include_target: bool,

    /// Include thread IDs
    pub include_thread_ids: bool,

    /// Environment filter string (e.g., "kiln_worker=debug,reqwest=warn")
    pub env_filter: Option<String>,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (machine-readable)
    Json,
    /// Pretty format (human-readable, colored)
    Pretty,
    /// Compact format (single line)
    #[default]
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" | "text" => Ok(LogFormat::Compact),
            _ => Err(TelemetryError::Config(format!("Unknown log format: {}", s))),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
            format: LogFormat::Compact,
            include_spans: false,
            include_location: false,
            include_target: true,
            include_thread_ids: false,
            env_filter: None,
        }
    }
}

impl LoggingConfig {
    /// Build the filter; an explicit directive wins, then `RUST_LOG`, then the level
    fn filter(&self) -> TelemetryResult<EnvFilter> {
        if let Some(filter_str) = &self.env_filter {
            return EnvFilter::try_new(filter_str)
                .map_err(|e| TelemetryError::Logging(e.to_string()));
        }

        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.level)
                .map_err(|e| TelemetryError::Logging(e.to_string())),
        }
    }
}

/// Initialize logging with configuration
pub fn init_logging(config: LoggingConfig) -> TelemetryResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let filter = config.filter()?;

    let span_events = if config.include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_span_events(span_events)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_target(config.include_target)
        .with_thread_ids(config.include_thread_ids)
        .with_writer(std::io::stderr);

    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.format {
        LogFormat::Json => registry.with(layer.json()).try_init(),
        LogFormat::Pretty => registry.with(layer.pretty()).try_init(),
        LogFormat::Compact => registry.with(layer.compact()).try_init(),
    };
    result.map_err(|e| TelemetryError::Logging(e.to_string()))?;

    tracing::debug!(
        "Logging initialized with level: {}, format: {:?}",
        config.level,
        config.format
    );

    Ok(())
}

/// Worker log context
#[derive(Debug, Clone)]
pub struct WorkerLogContext {
    pub worker_id: String,
    pub lease_secs: u64,
}

impl WorkerLogContext {
    /// Create a new worker log context
    pub fn new(worker_id: &str, lease_secs: u64) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            lease_secs,
        }
    }

    /// Create a tracing span with this context
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "worker",
            worker_id = %self.worker_id,
            lease_secs = self.lease_secs
        )
    }
}

/// Log context for a single frame
#[derive(Debug, Clone)]
pub struct FrameLogContext {
    pub frame_id: u64,
    pub idempotency_key: Option<String>,
}

impl FrameLogContext {
    /// Create a new frame log context
    pub fn new(frame_id: u64) -> Self {
        Self {
            frame_id,
            idempotency_key: None,
        }
    }

    /// Set the submission idempotency key
    pub fn with_idempotency_key(mut self, key: &str) -> Self {
        self.idempotency_key = Some(key.to_string());
        self
    }

    /// Create a tracing span with this context
    pub fn span(&self) -> tracing::Span {
        if let Some(ref key) = self.idempotency_key {
            tracing::info_span!("frame", frame_id = self.frame_id, idempotency_key = %key)
        } else {
            tracing::info_span!("frame", frame_id = self.frame_id)
        }
    }
}

/// Log frame render started
#[macro_export]
macro_rules! log_frame_started {
    ($frame_id:expr) => {
        tracing::info!(
            frame_id = %$frame_id,
            event = "frame.started",
            "Rendering frame"
        )
    };
}

/// Log frame rendered
#[macro_export]
macro_rules! log_frame_rendered {
    ($frame_id:expr, $duration_ms:expr) => {
        tracing::info!(
            frame_id = %$frame_id,
            duration_ms = $duration_ms,
            event = "frame.rendered",
            "Frame rendered"
        )
    };
}

/// Log frame accepted by the coordinator
#[macro_export]
macro_rules! log_frame_submitted {
    ($frame_id:expr, $granted:expr) => {
        tracing::info!(
            frame_id = %$frame_id,
            granted = $granted,
            event = "frame.submitted",
            "Frame acknowledged by coordinator"
        )
    };
}

/// Log a heartbeat the coordinator did not receive
#[macro_export]
macro_rules! log_heartbeat_failed {
    ($worker_id:expr, $error:expr) => {
        tracing::warn!(
            worker_id = %$worker_id,
            error = %$error,
            event = "heartbeat.failed",
            "Heartbeat failed, retrying on next tick"
        )
    };
}
