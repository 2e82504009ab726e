//! Recorder configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! explicit overrides (the daemon's CLI flags). The merged result is validated
//! once and never mutated afterwards.
//!
//! File keys mirror the field names; durations are whole seconds (`*_secs`)
//! and sizes are bytes:
//!
//! ```toml
//! rtsp_url = "rtsp://camera.local:554/stream1"
//! record_dir = "/srv/record"
//! segment_duration_secs = 21600
//! max_segment_count = 256
//! stale_timeout_secs = 30
//! ```

use fs_err as fs;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_RECORD_DIR: &str = "./record";
pub const DEFAULT_FFMPEG_PATH: &str = "ffmpeg";
pub const DEFAULT_SEGMENT_FORMAT: &str = "mkv";
pub const DEFAULT_ENCODER_LOG_LEVEL: &str = "info";
pub const DEFAULT_SEGMENT_DURATION_SECS: u64 = 6 * 60 * 60;
pub const DEFAULT_MAX_SEGMENT_COUNT: usize = 256;
pub const DEFAULT_MAX_TOTAL_BYTES: u64 = 500 * 1024 * 1024 * 1024;
pub const DEFAULT_STALE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_GRACEFUL_QUIT_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_TERMINATE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60 * 60;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Longest accepted value for any duration setting.
pub const MAX_DURATION: Duration = Duration::from_secs(366 * 24 * 60 * 60);

/// Transport the encoder uses to pull the RTSP stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RtspTransport {
    #[default]
    Tcp,
    Udp,
    Http,
}

impl RtspTransport {
    pub fn as_str(&self) -> &'static str {
        match self {
            RtspTransport::Tcp => "tcp",
            RtspTransport::Udp => "udp",
            RtspTransport::Http => "http",
        }
    }
}

impl fmt::Display for RtspTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RtspTransport {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(RtspTransport::Tcp),
            "udp" => Ok(RtspTransport::Udp),
            "http" => Ok(RtspTransport::Http),
            other => Err(format!(
                "unknown rtsp transport '{}' (expected tcp, udp or http)",
                other
            )),
        }
    }
}

/// Fully resolved, validated configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RecorderConfig {
    pub rtsp_url: String,
    pub record_dir: PathBuf,
    pub ffmpeg_path: PathBuf,
    pub rtsp_transport: RtspTransport,
    pub segment_format: String,
    pub encoder_log_level: String,
    pub encoder_stats: bool,
    pub segment_duration: Duration,
    pub max_segment_count: usize,
    pub max_total_bytes: u64,
    pub stale_timeout: Duration,
    pub graceful_quit_timeout: Duration,
    pub terminate_timeout: Duration,
    pub monitor_interval: Duration,
    pub cleanup_interval: Duration,
    pub poll_interval: Duration,
}

impl RecorderConfig {
    /// Defaults for everything except the source URL.
    pub fn new(rtsp_url: impl Into<String>) -> Self {
        let stale_timeout = Duration::from_secs(DEFAULT_STALE_TIMEOUT_SECS);
        Self {
            rtsp_url: rtsp_url.into(),
            record_dir: PathBuf::from(DEFAULT_RECORD_DIR),
            ffmpeg_path: PathBuf::from(DEFAULT_FFMPEG_PATH),
            rtsp_transport: RtspTransport::default(),
            segment_format: DEFAULT_SEGMENT_FORMAT.to_string(),
            encoder_log_level: DEFAULT_ENCODER_LOG_LEVEL.to_string(),
            encoder_stats: true,
            segment_duration: Duration::from_secs(DEFAULT_SEGMENT_DURATION_SECS),
            max_segment_count: DEFAULT_MAX_SEGMENT_COUNT,
            max_total_bytes: DEFAULT_MAX_TOTAL_BYTES,
            stale_timeout,
            graceful_quit_timeout: Duration::from_secs(DEFAULT_GRACEFUL_QUIT_TIMEOUT_SECS),
            terminate_timeout: Duration::from_secs(DEFAULT_TERMINATE_TIMEOUT_SECS),
            monitor_interval: default_monitor_interval(stale_timeout),
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }

    /// Resolves a config from a file layer and an override layer.
    /// Overrides win field by field.
    pub fn from_layers(file: ConfigLayer, overrides: ConfigLayer) -> Result<Self, ConfigError> {
        file.merge(overrides).resolve()
    }

    /// Filename extension of recorded segments (without the dot).
    pub fn segment_extension(&self) -> &str {
        &self.segment_format
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rtsp_url.trim().is_empty() {
            return Err(ConfigError::MissingRtspUrl);
        }
        if self.record_dir.as_os_str().is_empty() {
            return Err(invalid("record_dir", "must not be empty"));
        }
        if self.segment_format.is_empty()
            || !self
                .segment_format
                .chars()
                .all(|c| c.is_ascii_alphanumeric())
        {
            return Err(invalid(
                "segment_format",
                format!("'{}' is not a plain extension", self.segment_format),
            ));
        }
        if self.max_segment_count == 0 {
            return Err(invalid("max_segment_count", "must be at least 1"));
        }
        if self.max_total_bytes == 0 {
            return Err(invalid("max_total_bytes", "must be greater than 0"));
        }
        for (field, value) in [
            ("segment_duration", self.segment_duration),
            ("stale_timeout", self.stale_timeout),
            ("monitor_interval", self.monitor_interval),
            ("cleanup_interval", self.cleanup_interval),
            ("poll_interval", self.poll_interval),
        ] {
            if value.is_zero() {
                return Err(invalid(field, "must be greater than 0"));
            }
        }
        for (field, value) in [
            ("segment_duration", self.segment_duration),
            ("stale_timeout", self.stale_timeout),
            ("graceful_quit_timeout", self.graceful_quit_timeout),
            ("terminate_timeout", self.terminate_timeout),
            ("monitor_interval", self.monitor_interval),
            ("cleanup_interval", self.cleanup_interval),
            ("poll_interval", self.poll_interval),
        ] {
            if value > MAX_DURATION {
                return Err(invalid(
                    field,
                    format!("must be at most {} seconds", MAX_DURATION.as_secs()),
                ));
            }
        }
        if self.monitor_interval > self.stale_timeout {
            return Err(invalid(
                "monitor_interval",
                "must not be longer than stale_timeout",
            ));
        }
        Ok(())
    }

    /// Creates the recording directory if needed. Failure here is fatal at startup.
    pub fn prepare_record_dir(&self) -> Result<(), ConfigError> {
        fs::create_dir_all(&self.record_dir).map_err(|source| ConfigError::RecordDir {
            path: self.record_dir.clone(),
            source,
        })?;
        let metadata = fs::metadata(&self.record_dir).map_err(|source| ConfigError::RecordDir {
            path: self.record_dir.clone(),
            source,
        })?;
        if !metadata.is_dir() {
            return Err(ConfigError::RecordDir {
                path: self.record_dir.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "not a directory"),
            });
        }
        Ok(())
    }
}

/// Liveness tick derived from the stale timeout: a third of it, at least 1ms.
pub fn default_monitor_interval(stale_timeout: Duration) -> Duration {
    (stale_timeout / 3).max(Duration::from_millis(1))
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

/// One partial layer of configuration. Every field is optional; unset fields
/// fall through to the layer below.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigLayer {
    pub rtsp_url: Option<String>,
    pub record_dir: Option<PathBuf>,
    pub ffmpeg_path: Option<PathBuf>,
    pub rtsp_transport: Option<RtspTransport>,
    pub segment_format: Option<String>,
    pub encoder_log_level: Option<String>,
    pub encoder_stats: Option<bool>,
    pub segment_duration_secs: Option<u64>,
    pub max_segment_count: Option<usize>,
    pub max_total_bytes: Option<u64>,
    pub stale_timeout_secs: Option<u64>,
    pub graceful_quit_timeout_secs: Option<u64>,
    pub terminate_timeout_secs: Option<u64>,
    pub monitor_interval_secs: Option<u64>,
    pub cleanup_interval_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
}

impl ConfigLayer {
    pub fn from_toml_str(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|err| ConfigError::Malformed {
            path: path.to_path_buf(),
            details: err.to_string(),
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents, path)
    }

    /// Layers `higher` on top of `self`.
    pub fn merge(self, higher: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            rtsp_url: higher.rtsp_url.or(self.rtsp_url),
            record_dir: higher.record_dir.or(self.record_dir),
            ffmpeg_path: higher.ffmpeg_path.or(self.ffmpeg_path),
            rtsp_transport: higher.rtsp_transport.or(self.rtsp_transport),
            segment_format: higher.segment_format.or(self.segment_format),
            encoder_log_level: higher.encoder_log_level.or(self.encoder_log_level),
            encoder_stats: higher.encoder_stats.or(self.encoder_stats),
            segment_duration_secs: higher.segment_duration_secs.or(self.segment_duration_secs),
            max_segment_count: higher.max_segment_count.or(self.max_segment_count),
            max_total_bytes: higher.max_total_bytes.or(self.max_total_bytes),
            stale_timeout_secs: higher.stale_timeout_secs.or(self.stale_timeout_secs),
            graceful_quit_timeout_secs: higher
                .graceful_quit_timeout_secs
                .or(self.graceful_quit_timeout_secs),
            terminate_timeout_secs: higher
                .terminate_timeout_secs
                .or(self.terminate_timeout_secs),
            monitor_interval_secs: higher.monitor_interval_secs.or(self.monitor_interval_secs),
            cleanup_interval_secs: higher.cleanup_interval_secs.or(self.cleanup_interval_secs),
            poll_interval_ms: higher.poll_interval_ms.or(self.poll_interval_ms),
        }
    }

    /// Applies this layer over the defaults and validates the result.
    pub fn resolve(self) -> Result<RecorderConfig, ConfigError> {
        let rtsp_url = self.rtsp_url.ok_or(ConfigError::MissingRtspUrl)?;
        let mut config = RecorderConfig::new(rtsp_url);

        if let Some(value) = self.record_dir {
            config.record_dir = value;
        }
        if let Some(value) = self.ffmpeg_path {
            config.ffmpeg_path = value;
        }
        if let Some(value) = self.rtsp_transport {
            config.rtsp_transport = value;
        }
        if let Some(value) = self.segment_format {
            config.segment_format = value.trim_start_matches('.').to_string();
        }
        if let Some(value) = self.encoder_log_level {
            config.encoder_log_level = value;
        }
        if let Some(value) = self.encoder_stats {
            config.encoder_stats = value;
        }
        if let Some(secs) = self.segment_duration_secs {
            config.segment_duration = Duration::from_secs(secs);
        }
        if let Some(value) = self.max_segment_count {
            config.max_segment_count = value;
        }
        if let Some(value) = self.max_total_bytes {
            config.max_total_bytes = value;
        }
        if let Some(secs) = self.stale_timeout_secs {
            config.stale_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.graceful_quit_timeout_secs {
            config.graceful_quit_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.terminate_timeout_secs {
            config.terminate_timeout = Duration::from_secs(secs);
        }
        config.monitor_interval = match self.monitor_interval_secs {
            Some(secs) => Duration::from_secs(secs).min(config.stale_timeout),
            None => default_monitor_interval(config.stale_timeout),
        };
        if let Some(secs) = self.cleanup_interval_secs {
            config.cleanup_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = self.poll_interval_ms {
            config.poll_interval = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }
}
