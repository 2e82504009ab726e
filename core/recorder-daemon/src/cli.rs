//! Command-line surface. Every flag overrides the matching config file key.

use clap::Parser;
use recorder_core::{ConfigLayer, RtspTransport};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "recorder-daemon")]
#[command(about = "Continuously records an RTSP stream into rotating segment files")]
#[command(version)]
pub struct Cli {
    /// TOML config file (default: ~/.config/rtsp-recorder/recorder.toml if present)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Directory for daily-rotated log files (logs go to stderr otherwise)
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Camera stream URL
    #[arg(long, value_name = "URL")]
    pub rtsp_url: Option<String>,

    /// Directory that receives segment files
    #[arg(long, value_name = "DIR")]
    pub record_dir: Option<PathBuf>,

    /// Encoder executable
    #[arg(long, value_name = "PATH")]
    pub ffmpeg_path: Option<PathBuf>,

    /// RTSP lower transport: tcp, udp or http
    #[arg(long, value_name = "TRANSPORT")]
    pub rtsp_transport: Option<RtspTransport>,

    /// Container format, also used as the file extension
    #[arg(long, value_name = "EXT")]
    pub segment_format: Option<String>,

    /// Encoder log verbosity
    #[arg(long, value_name = "LEVEL")]
    pub encoder_log_level: Option<String>,

    /// Whether the encoder prints progress statistics
    #[arg(long, value_name = "BOOL")]
    pub encoder_stats: Option<bool>,

    #[arg(long, value_name = "SECS")]
    pub segment_duration_secs: Option<u64>,

    /// Keep at most this many completed segments
    #[arg(long, value_name = "N")]
    pub max_segment_count: Option<usize>,

    /// Keep completed segments under this many bytes in total
    #[arg(long, value_name = "BYTES")]
    pub max_total_bytes: Option<u64>,

    /// Restart the encoder after this long without output growth
    #[arg(long, value_name = "SECS")]
    pub stale_timeout_secs: Option<u64>,

    #[arg(long, value_name = "SECS")]
    pub graceful_quit_timeout_secs: Option<u64>,

    #[arg(long, value_name = "SECS")]
    pub terminate_timeout_secs: Option<u64>,

    #[arg(long, value_name = "SECS")]
    pub monitor_interval_secs: Option<u64>,

    #[arg(long, value_name = "SECS")]
    pub cleanup_interval_secs: Option<u64>,

    /// Supervisor loop tick
    #[arg(long, value_name = "MS")]
    pub poll_interval_ms: Option<u64>,
}

impl Cli {
    /// Config values given on the command line.
    pub fn overrides(&self) -> ConfigLayer {
        ConfigLayer {
            rtsp_url: self.rtsp_url.clone(),
            record_dir: self.record_dir.clone(),
            ffmpeg_path: self.ffmpeg_path.clone(),
            rtsp_transport: self.rtsp_transport,
            segment_format: self.segment_format.clone(),
            encoder_log_level: self.encoder_log_level.clone(),
            encoder_stats: self.encoder_stats,
            segment_duration_secs: self.segment_duration_secs,
            max_segment_count: self.max_segment_count,
            max_total_bytes: self.max_total_bytes,
            stale_timeout_secs: self.stale_timeout_secs,
            graceful_quit_timeout_secs: self.graceful_quit_timeout_secs,
            terminate_timeout_secs: self.terminate_timeout_secs,
            monitor_interval_secs: self.monitor_interval_secs,
            cleanup_interval_secs: self.cleanup_interval_secs,
            poll_interval_ms: self.poll_interval_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_become_overrides() {
        let cli = Cli::try_parse_from([
            "recorder-daemon",
            "--rtsp-url",
            "rtsp://cam/1",
            "--rtsp-transport",
            "udp",
            "--max-segment-count",
            "12",
            "--encoder-stats",
            "false",
        ])
        .expect("parse");

        let layer = cli.overrides();
        assert_eq!(layer.rtsp_url.as_deref(), Some("rtsp://cam/1"));
        assert_eq!(layer.rtsp_transport, Some(RtspTransport::Udp));
        assert_eq!(layer.max_segment_count, Some(12));
        assert_eq!(layer.encoder_stats, Some(false));
        assert_eq!(layer.record_dir, None);
    }

    #[test]
    fn unknown_transport_is_rejected() {
        let result = Cli::try_parse_from(["recorder-daemon", "--rtsp-transport", "quic"]);
        assert!(result.is_err());
    }

    #[test]
    fn cli_values_win_over_file_values() {
        let file = ConfigLayer::from_toml_str(
            "rtsp_url = \"rtsp://file/1\"\nmax_segment_count = 40\n",
            std::path::Path::new("recorder.toml"),
        )
        .expect("toml");
        let cli = Cli::try_parse_from(["recorder-daemon", "--max-segment-count", "7"])
            .expect("parse");

        let config = file.merge(cli.overrides()).resolve().expect("resolve");
        assert_eq!(config.rtsp_url, "rtsp://file/1");
        assert_eq!(config.max_segment_count, 7);
    }
}
