//! RTSP recorder daemon entrypoint.
//!
//! Resolves configuration (defaults, then the TOML file, then CLI flags),
//! installs termination handlers, and runs the recording supervisor until a
//! SIGINT/SIGTERM arrives. Exits 0 after the encoder has been reaped, 1 on
//! invalid configuration.

mod cli;
mod logging;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use cli::Cli;
use recorder_core::{
    ConfigError, ConfigLayer, FfmpegLauncher, RecorderConfig, ShutdownFlag, Supervisor,
};

const CONFIG_DIR_NAME: &str = "rtsp-recorder";
const CONFIG_FILE_NAME: &str = "recorder.toml";

fn main() {
    let cli = Cli::parse();
    let _logging_guard = logging::init(cli.log_dir.as_deref());

    let config = match load_config(&cli) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            error!(error = %err, "Invalid configuration");
            std::process::exit(1);
        }
    };

    if let Err(err) = config.prepare_record_dir() {
        error!(error = %err, "Failed to prepare recording directory");
        std::process::exit(1);
    }

    let shutdown = ShutdownFlag::new();
    let handler_flag = shutdown.clone();
    if let Err(err) = ctrlc::set_handler(move || handler_flag.request()) {
        error!(error = %err, "Failed to install termination handler");
        std::process::exit(1);
    }

    info!(
        pid = std::process::id(),
        encoder = %config.ffmpeg_path.display(),
        transport = %config.rtsp_transport,
        format = %config.segment_format,
        max_segments = config.max_segment_count,
        max_bytes = config.max_total_bytes,
        "Recorder daemon started"
    );

    let launcher = FfmpegLauncher::new(Arc::clone(&config));
    let stats = Supervisor::new(config, launcher, shutdown).run();

    info!(
        sessions = stats.sessions_launched,
        expected_exits = stats.expected_exits,
        crashes = stats.crash_exits,
        "Recorder daemon exiting"
    );
}

fn load_config(cli: &Cli) -> Result<RecorderConfig, ConfigError> {
    let file = match config_file_path(cli) {
        Some(path) => {
            info!(path = %path.display(), "Loading config file");
            ConfigLayer::load(&path)?
        }
        None => ConfigLayer::default(),
    };
    RecorderConfig::from_layers(file, cli.overrides())
}

/// An explicit `--config` must exist; the default location is optional.
fn config_file_path(cli: &Cli) -> Option<PathBuf> {
    if let Some(path) = &cli.config {
        return Some(path.clone());
    }
    let path = dirs::home_dir()?
        .join(".config")
        .join(CONFIG_DIR_NAME)
        .join(CONFIG_FILE_NAME);
    path.is_file().then_some(path)
}
