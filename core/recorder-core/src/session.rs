//! One encoder invocation and its observed lifecycle.

use chrono::{DateTime, Local};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::segment::segment_path;

/// Exit code of a reaped encoder. Signal deaths are reported as `128 + signal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncoderExit(pub i32);

impl EncoderExit {
    pub fn code(self) -> i32 {
        self.0
    }

    pub fn from_status(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return EncoderExit(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return EncoderExit(128 + signal);
            }
        }
        EncoderExit(-1)
    }
}

impl fmt::Display for EncoderExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit code {}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Stale,
    Exited(EncoderExit),
}

#[derive(Debug, Clone)]
pub struct RecordingSession {
    pub id: u64,
    /// First segment the encoder is expected to write.
    pub output_path: PathBuf,
    pub started_at: DateTime<Local>,
    pub started: Instant,
    pub state: SessionState,
    pub last_observed_size: u64,
    pub last_observed_time: Option<Instant>,
}

impl RecordingSession {
    pub fn begin(id: u64, record_dir: &Path, extension: &str) -> Self {
        let started_at = Local::now();
        Self {
            id,
            output_path: segment_path(record_dir, started_at, extension),
            started_at,
            started: Instant::now(),
            state: SessionState::Running,
            last_observed_size: 0,
            last_observed_time: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_derives_output_path_from_start_time() {
        let session = RecordingSession::begin(7, Path::new("record"), "mkv");
        let name = session
            .output_path
            .file_name()
            .and_then(|n| n.to_str())
            .expect("file name");
        assert_eq!(
            name,
            format!("{}.mkv", session.started_at.format("%Y-%m-%d_%H-%M-%S"))
        );
        assert_eq!(session.state, SessionState::Running);
    }

    #[cfg(unix)]
    #[test]
    fn signal_deaths_map_to_shell_convention() {
        use std::os::unix::process::ExitStatusExt;
        let killed = std::process::ExitStatus::from_raw(libc::SIGKILL);
        assert_eq!(EncoderExit::from_status(killed), EncoderExit(137));

        let exited = std::process::ExitStatus::from_raw(1 << 8);
        assert_eq!(EncoderExit::from_status(exited), EncoderExit(1));
    }
}
