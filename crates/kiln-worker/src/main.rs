//! Kiln Worker - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use kiln_core::KilnConfig;
use kiln_telemetry::{init_logging, LogFormat, LoggingConfig};
use kiln_worker::{
    fetch_project_to, install_shutdown_handler, BlenderEngine, ControllerSettings, Coordinator,
    HttpCoordinator, RenderEngine, WorkerController,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Kiln Worker - Render farm worker
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "KILN_CONFIG")]
    config: Option<PathBuf>,

    /// Coordinator base URL
    #[arg(short, long, env = "KILN_SERVER_URL")]
    server: Option<String>,

    /// Compute device type (CPU, CUDA, OPTIX, HIP, ...); all GPUs if omitted
    #[arg(short, long, env = "KILN_DEVICE")]
    device: Option<String>,

    /// Directory for the project file and rendered frames
    #[arg(long, env = "KILN_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Frames requested at registration
    #[arg(short = 'n', long)]
    batch_size: Option<u32>,

    /// Log level
    #[arg(long, env = "KILN_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (compact, pretty, json)
    #[arg(long)]
    log_format: Option<String>,

    /// Print the render devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = KilnConfig::load(args.config.as_ref())?;

    // CLI flags override file and environment
    if let Some(server) = args.server {
        config.coordinator.url = server;
    }
    if let Some(device) = args.device {
        config.engine.device = Some(device);
    }
    if let Some(work_dir) = args.work_dir {
        config.worker.work_dir = work_dir;
    }
    if let Some(batch_size) = args.batch_size {
        config.worker.batch_size = batch_size;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }

    config.validate()?;

    let format: LogFormat = config.logging.format.parse()?;
    init_logging(LoggingConfig {
        level: config.logging.level.clone(),
        format,
        env_filter: config.logging.env_filter.clone(),
        ..Default::default()
    })?;

    info!("Starting Kiln Worker v{}", env!("CARGO_PKG_VERSION"));
    info!("Coordinator: {}", config.coordinator.url);

    let project = config.worker.project_path();
    let mut engine = BlenderEngine::new(
        config.engine.clone(),
        project.clone(),
        config.worker.output_dir(),
    );

    if args.list_devices {
        for device in engine.enumerate_devices().await? {
            println!("{}", device);
        }
        return Ok(());
    }

    let coordinator: Arc<dyn Coordinator> = Arc::new(HttpCoordinator::new(&config.coordinator)?);

    fetch_project_to(coordinator.as_ref(), &project)
        .await
        .context("failed to fetch project")?;
    tokio::fs::create_dir_all(config.worker.output_dir()).await?;

    engine.configure(config.engine.device.as_deref()).await?;

    let cancel = CancellationToken::new();
    install_shutdown_handler(cancel.clone())?;

    let controller = WorkerController::new(
        coordinator,
        Box::new(engine),
        ControllerSettings::from_config(&config),
    )
    .with_cancellation(cancel);

    let summary = controller.run().await?;
    info!(
        "Kiln Worker stopped after {} frames",
        summary.frames_submitted
    );

    Ok(())
}
