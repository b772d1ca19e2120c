//! Configuration structures for kiln

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a kiln worker
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KilnConfig {
    /// Coordinator connection
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Worker behaviour
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Lease keep-alive
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Retry budget for register and submit
    #[serde(default)]
    pub retry: RetryConfig,

    /// Render engine
    #[serde(default)]
    pub engine: EngineConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl KilnConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            crate::Error::Configuration(format!("Failed to read config file: {}", e))
        })?;

        Ok(toml::from_str(&content)?)
    }

    /// Apply environment variable overrides on top of the current values
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("KILN_SERVER_URL") {
            self.coordinator.url = url;
        }
        if let Ok(timeout) = std::env::var("KILN_REQUEST_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.coordinator.request_timeout_secs = secs;
            }
        }
        if let Ok(dir) = std::env::var("KILN_WORK_DIR") {
            self.worker.work_dir = PathBuf::from(dir);
        }
        if let Ok(blender) = std::env::var("KILN_BLENDER") {
            self.engine.blender_path = blender;
        }
        if let Ok(device) = std::env::var("KILN_DEVICE") {
            self.engine.device = Some(device);
        }
        if let Ok(level) = std::env::var("KILN_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Merge configuration from file and environment; env vars take precedence
    pub fn load(path: Option<impl AsRef<Path>>) -> crate::Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };

        config.apply_env();
        Ok(config)
    }

    /// Check the values no worker can run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.coordinator.url.trim().is_empty() {
            return Err(crate::Error::Configuration(
                "coordinator url must not be empty".to_string(),
            ));
        }
        if self.worker.batch_size == 0 {
            return Err(crate::Error::Configuration(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if !(self.heartbeat.fraction > 0.0 && self.heartbeat.fraction < 1.0) {
            return Err(crate::Error::Configuration(format!(
                "heartbeat fraction must be between 0 and 1 (exclusive), got {}",
                self.heartbeat.fraction
            )));
        }
        if self.heartbeat.interval_secs == Some(0) {
            return Err(crate::Error::Configuration(
                "heartbeat interval must be non-zero".to_string(),
            ));
        }
        if self.retry.register_attempts == 0 || self.retry.submit_attempts == 0 {
            return Err(crate::Error::Configuration(
                "retry attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Coordinator connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Base URL of the coordinator
    #[serde(default = "default_coordinator_url")]
    pub url: String,

    /// Timeout for register, heartbeat and project download, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// TCP connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Timeout for artifact uploads in seconds
    #[serde(default = "default_upload_timeout")]
    pub upload_timeout_secs: u64,
}

fn default_coordinator_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_upload_timeout() -> u64 {
    300
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            url: default_coordinator_url(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            upload_timeout_secs: default_upload_timeout(),
        }
    }
}

impl CoordinatorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Frames to lease per registration
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Directory for the project file and rendered frames
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// File name the downloaded project is stored under
    #[serde(default = "default_project_file")]
    pub project_file: String,

    /// Keep rendered frames on disk after the coordinator acknowledges them
    #[serde(default)]
    pub keep_artifacts: bool,
}

fn default_batch_size() -> u32 {
    1
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("./kiln-work")
}

fn default_project_file() -> String {
    "project.blend".to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            work_dir: default_work_dir(),
            project_file: default_project_file(),
            keep_artifacts: false,
        }
    }
}

impl WorkerConfig {
    /// Where the downloaded project file lives
    pub fn project_path(&self) -> PathBuf {
        self.work_dir.join(&self.project_file)
    }

    /// Where rendered frames are written
    pub fn output_dir(&self) -> PathBuf {
        self.work_dir.join("frames")
    }
}

/// Heartbeat configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Share of the lease duration used as the heartbeat period
    #[serde(default = "default_heartbeat_fraction")]
    pub fraction: f64,

    /// Fixed period in seconds; overrides `fraction` when set
    pub interval_secs: Option<u64>,
}

fn default_heartbeat_fraction() -> f64 {
    0.33
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            fraction: default_heartbeat_fraction(),
            interval_secs: None,
        }
    }
}

impl HeartbeatConfig {
    /// Derive the heartbeat period for a lease, rejecting periods that would
    /// let the lease lapse between two heartbeats
    pub fn period_for(&self, lease: Duration) -> crate::Result<Duration> {
        let period = match self.interval_secs {
            Some(secs) => Duration::from_secs(secs),
            None => {
                if !(self.fraction > 0.0 && self.fraction < 1.0) {
                    return Err(crate::Error::Configuration(format!(
                        "heartbeat fraction must be between 0 and 1 (exclusive), got {}",
                        self.fraction
                    )));
                }
                lease.mul_f64(self.fraction)
            }
        };

        validate_heartbeat_period(period, lease)?;
        Ok(period)
    }
}

/// A heartbeat period must be non-zero and strictly shorter than the lease
pub fn validate_heartbeat_period(period: Duration, lease: Duration) -> crate::Result<()> {
    if period.is_zero() {
        return Err(crate::Error::Configuration(
            "heartbeat period must be non-zero".to_string(),
        ));
    }
    if period >= lease {
        return Err(crate::Error::Configuration(format!(
            "heartbeat period {:?} must be shorter than the lease duration {:?}",
            period, lease
        )));
    }
    Ok(())
}

/// Retry budget for calls on the main loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts for the registration call, including the first
    #[serde(default = "default_register_attempts")]
    pub register_attempts: u32,

    /// Attempts for each submission, including the first
    #[serde(default = "default_submit_attempts")]
    pub submit_attempts: u32,

    /// Delay before the second attempt in milliseconds; doubles per attempt
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Upper bound for the delay between attempts in milliseconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_register_attempts() -> u32 {
    3
}

fn default_submit_attempts() -> u32 {
    1
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            register_attempts: default_register_attempts(),
            submit_attempts: default_submit_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

/// Render engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path to the blender executable
    #[serde(default = "default_blender_path")]
    pub blender_path: String,

    /// Compute device type (e.g. CUDA, OPTIX, HIP, CPU); all GPUs when unset
    pub device: Option<String>,

    /// Output file name pattern; runs of `#` become the zero-padded frame number
    #[serde(default = "default_output_pattern")]
    pub output_pattern: String,

    /// Output image format passed to blender
    #[serde(default = "default_image_format")]
    pub image_format: String,

    /// Hard limit for a single frame render in seconds
    pub render_timeout_secs: Option<u64>,
}

fn default_blender_path() -> String {
    "blender".to_string()
}

fn default_output_pattern() -> String {
    "frame_#####".to_string()
}

fn default_image_format() -> String {
    "PNG".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            blender_path: default_blender_path(),
            device: None,
            output_pattern: default_output_pattern(),
            image_format: default_image_format(),
            render_timeout_secs: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact or json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Explicit filter directive, e.g. "kiln_worker=debug,reqwest=warn"
    pub env_filter: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            env_filter: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = KilnConfig::default();
        assert_eq!(config.coordinator.url, "http://localhost:8080");
        assert_eq!(config.worker.batch_size, 1);
        assert_eq!(config.retry.submit_attempts, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let config: KilnConfig = toml::from_str(
            r#"
            [coordinator]
            url = "http://farm:9000"

            [heartbeat]
            interval_secs = 60

            [engine]
            device = "OPTIX"
            "#,
        )
        .unwrap();

        assert_eq!(config.coordinator.url, "http://farm:9000");
        assert_eq!(config.coordinator.request_timeout_secs, 30);
        assert_eq!(config.heartbeat.interval_secs, Some(60));
        assert_eq!(config.engine.device.as_deref(), Some("OPTIX"));
        assert_eq!(config.worker.project_path(), PathBuf::from("./kiln-work/project.blend"));
    }

    #[test]
    fn test_heartbeat_period_from_fraction() {
        let config = HeartbeatConfig {
            fraction: 0.5,
            interval_secs: None,
        };
        let period = config.period_for(Duration::from_secs(300)).unwrap();
        assert_eq!(period, Duration::from_secs(150));
    }

    #[test]
    fn test_heartbeat_fraction_out_of_range_is_an_error() {
        let lease = Duration::from_secs(300);

        for fraction in [-0.5, 0.0, 1.0, 2.0, f64::NAN, f64::INFINITY] {
            let config = HeartbeatConfig {
                fraction,
                interval_secs: None,
            };
            let err = config.period_for(lease).unwrap_err();
            assert!(
                matches!(err, crate::Error::Configuration(_)),
                "fraction {fraction} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_heartbeat_period_must_be_shorter_than_lease() {
        let lease = Duration::from_secs(300);

        assert!(validate_heartbeat_period(Duration::from_secs(299), lease).is_ok());
        assert!(validate_heartbeat_period(Duration::from_secs(300), lease).is_err());
        assert!(validate_heartbeat_period(Duration::from_secs(301), lease).is_err());
        assert!(validate_heartbeat_period(Duration::ZERO, lease).is_err());

        let config = HeartbeatConfig {
            fraction: 0.33,
            interval_secs: Some(300),
        };
        assert!(config.period_for(lease).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = KilnConfig::default();
        config.worker.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = KilnConfig::default();
        config.heartbeat.fraction = 1.0;
        assert!(config.validate().is_err());

        let mut config = KilnConfig::default();
        config.retry.register_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = KilnConfig::default();
        config.coordinator.url = "  ".to_string();
        assert!(config.validate().is_err());
    }
}
