//! Render engines
//!
//! The worker treats rendering as an opaque capability: give an engine a frame
//! number, get back the path of the rendered image. [`BlenderEngine`] drives a
//! local Blender install in background mode.

use async_trait::async_trait;
use kiln_core::config::EngineConfig;
use kiln_core::{Error, FrameId, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// A compute device the engine can render on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceDescriptor {
    /// Backend type as Blender names it (CUDA, OPTIX, HIP, ONEAPI, METAL, CPU)
    pub kind: String,

    /// Human readable device name
    pub name: String,
}

impl DeviceDescriptor {
    pub fn is_cpu(&self) -> bool {
        self.kind.eq_ignore_ascii_case("CPU")
    }
}

impl std::fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.kind)
    }
}

/// Trait for render engines
#[async_trait]
pub trait RenderEngine: Send + Sync {
    /// Select the compute device; `None` selects every available device
    async fn configure(&mut self, device: Option<&str>) -> Result<()>;

    /// List the devices this machine offers
    async fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Render on every device that can compute
    async fn select_all_devices_for_compute(&mut self) -> Result<()>;

    /// Render one frame, returning the path of the produced image
    async fn execute(&self, frame: FrameId) -> Result<PathBuf>;

    /// Get the engine name
    fn name(&self) -> &str;
}

/// Marker printed in front of every device line by the enumeration script
const DEVICE_MARKER: &str = "KILN_DEVICE";

/// Python run inside Blender to list Cycles compute devices
const ENUMERATE_DEVICES_SCRIPT: &str = r#"
import bpy
prefs = bpy.context.preferences.addons['cycles'].preferences
seen = set()
for kind in ('CUDA', 'OPTIX', 'HIP', 'ONEAPI', 'METAL'):
    try:
        prefs.compute_device_type = kind
    except TypeError:
        continue
    prefs.get_devices()
    for d in prefs.devices:
        key = (d.type, d.name)
        if key in seen:
            continue
        seen.add(key)
        print('KILN_DEVICE', d.type, d.name, sep='\t')
"#;

/// Renders frames by spawning `blender -b`
#[derive(Debug, Clone)]
pub struct BlenderEngine {
    config: EngineConfig,
    project: PathBuf,
    output_dir: PathBuf,
    /// Cycles device type passed on the command line; `None` renders on CPU
    device_kind: Option<String>,
}

impl BlenderEngine {
    /// Create an engine for a project file, writing frames into `output_dir`
    pub fn new(
        config: EngineConfig,
        project: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            project: project.into(),
            output_dir: output_dir.into(),
            device_kind: None,
        }
    }

    /// The selected device type, if any
    pub fn device_kind(&self) -> Option<&str> {
        self.device_kind.as_deref()
    }

    /// Command-line arguments for rendering one frame
    pub fn render_args(&self, frame: FrameId) -> Vec<String> {
        let mut args = vec![
            "-b".to_string(),
            self.project.display().to_string(),
            "-o".to_string(),
            self.output_dir
                .join(&self.config.output_pattern)
                .display()
                .to_string(),
            "-F".to_string(),
            self.config.image_format.clone(),
            "-f".to_string(),
            frame.to_string(),
        ];

        if let Some(kind) = &self.device_kind {
            args.extend([
                "--".to_string(),
                "--cycles-device".to_string(),
                kind.clone(),
            ]);
        }

        args
    }

    /// Where Blender writes the image for `frame`
    pub fn output_path(&self, frame: FrameId) -> PathBuf {
        let file_name = expand_frame_pattern(&self.config.output_pattern, frame);
        let extension = image_extension(&self.config.image_format);
        self.output_dir.join(format!("{}.{}", file_name, extension))
    }

    fn render_timeout(&self) -> Option<Duration> {
        self.config.render_timeout_secs.map(Duration::from_secs)
    }
}

#[async_trait]
impl RenderEngine for BlenderEngine {
    async fn configure(&mut self, device: Option<&str>) -> Result<()> {
        let Some(selector) = device else {
            return self.select_all_devices_for_compute().await;
        };

        if selector.eq_ignore_ascii_case("CPU") {
            self.device_kind = None;
            info!("Rendering on CPU");
            return Ok(());
        }

        let devices = self.enumerate_devices().await?;
        let device = devices
            .iter()
            .find(|d| d.kind.eq_ignore_ascii_case(selector))
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "no {} device available (found: {})",
                    selector,
                    describe(&devices)
                ))
            })?;

        self.device_kind = Some(device.kind.clone());
        info!("Rendering on {} devices", device.kind);
        Ok(())
    }

    async fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        let output = Command::new(&self.config.blender_path)
            .args(["-b", "--factory-startup", "--python-expr", ENUMERATE_DEVICES_SCRIPT])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                Error::Engine(format!(
                    "failed to run {}: {}",
                    self.config.blender_path, e
                ))
            })?;

        if !output.status.success() {
            return Err(Error::Engine(format!(
                "device enumeration exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let devices = parse_device_listing(&String::from_utf8_lossy(&output.stdout));
        debug!("Enumerated devices: {}", describe(&devices));
        Ok(devices)
    }

    async fn select_all_devices_for_compute(&mut self) -> Result<()> {
        let devices = self.enumerate_devices().await?;

        self.device_kind = pick_compute_kind(&devices);
        match &self.device_kind {
            Some(kind) => info!("Rendering on all {} devices", kind),
            None => warn!("No GPU compute devices found, rendering on CPU"),
        }
        Ok(())
    }

    async fn execute(&self, frame: FrameId) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.output_dir).await?;

        let output_path = self.output_path(frame);
        let args = self.render_args(frame);
        debug!("Running {} {}", self.config.blender_path, args.join(" "));

        let child = Command::new(&self.config.blender_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match self.render_timeout() {
            Some(limit) => tokio::time::timeout(limit, child).await.map_err(|_| Error::Execution {
                frame_id: frame,
                message: format!("render timed out after {} seconds", limit.as_secs()),
            })?,
            None => child.await,
        }
        .map_err(|e| Error::Execution {
            frame_id: frame,
            message: format!("failed to spawn {}: {}", self.config.blender_path, e),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Execution {
                frame_id: frame,
                message: format!(
                    "blender exited with code {:?}: {}",
                    output.status.code(),
                    stderr.trim()
                ),
            });
        }

        if !tokio::fs::try_exists(&output_path).await.unwrap_or(false) {
            return Err(Error::Execution {
                frame_id: frame,
                message: format!("expected output {} was not written", output_path.display()),
            });
        }

        Ok(output_path)
    }

    fn name(&self) -> &str {
        "blender"
    }
}

/// Parse the enumeration script's output into device descriptors
pub fn parse_device_listing(stdout: &str) -> Vec<DeviceDescriptor> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.trim_end().splitn(3, '\t');
            if fields.next()? != DEVICE_MARKER {
                return None;
            }
            let kind = fields.next()?.trim();
            let name = fields.next()?.trim();
            if kind.is_empty() {
                return None;
            }
            Some(DeviceDescriptor {
                kind: kind.to_string(),
                name: name.to_string(),
            })
        })
        .collect()
}

/// Choose the device type to render with when all devices are wanted.
///
/// Prefers OptiX over the other GPU backends, and returns `None` (CPU) when no
/// GPU is present.
pub fn pick_compute_kind(devices: &[DeviceDescriptor]) -> Option<String> {
    const PREFERENCE: [&str; 5] = ["OPTIX", "CUDA", "HIP", "ONEAPI", "METAL"];

    PREFERENCE
        .iter()
        .find(|kind| {
            devices
                .iter()
                .any(|d| !d.is_cpu() && d.kind.eq_ignore_ascii_case(kind))
        })
        .map(|kind| kind.to_string())
}

/// Replace each run of `#` with the frame number padded to the run's width,
/// as Blender does. A pattern without `#` gets a 4-digit number appended.
pub fn expand_frame_pattern(pattern: &str, frame: FrameId) -> String {
    let file_name = Path::new(pattern)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| pattern.to_string());

    if !file_name.contains('#') {
        return format!("{}{:04}", file_name, frame.get());
    }

    let mut expanded = String::with_capacity(file_name.len() + 8);
    let mut chars = file_name.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '#' {
            expanded.push(c);
            continue;
        }
        let mut width = 1;
        while chars.peek() == Some(&'#') {
            chars.next();
            width += 1;
        }
        expanded.push_str(&format!("{:0width$}", frame.get(), width = width));
    }
    expanded
}

fn image_extension(format: &str) -> &'static str {
    match format.to_ascii_uppercase().as_str() {
        "JPEG" => "jpg",
        "OPEN_EXR" | "OPEN_EXR_MULTILAYER" => "exr",
        "TIFF" => "tif",
        "BMP" => "bmp",
        "TARGA" | "TARGA_RAW" => "tga",
        "WEBP" => "webp",
        _ => "png",
    }
}

fn describe(devices: &[DeviceDescriptor]) -> String {
    if devices.is_empty() {
        return "none".to_string();
    }
    devices
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
