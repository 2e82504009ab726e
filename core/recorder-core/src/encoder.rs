//! Encoder process controller.
//!
//! The supervisor only talks to [`EncoderLauncher`] and [`EncoderProcess`];
//! [`FfmpegLauncher`] is the production implementation. The encoder segments
//! its own output by time, so a single process writes many segment files over
//! its lifetime.
//!
//! The encoder runs in its own process group. Terminal interrupts aimed at the
//! daemon therefore never reach it directly; only the escalation protocol in
//! [`crate::shutdown`] stops it.

use fs_err as fs;
use std::ffi::OsString;
use std::io::{self, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::RecorderConfig;
use crate::error::LaunchError;
use crate::segment::encoder_output_pattern;
use crate::session::{EncoderExit, RecordingSession};

/// Interactive command that makes ffmpeg finalize its output and exit.
const GRACEFUL_QUIT_INPUT: &[u8] = b"q\n";

/// A running encoder subprocess.
pub trait EncoderProcess: Send {
    fn id(&self) -> u32;

    /// Non-blocking exit check. Reaps the process when it has exited.
    fn poll_exit(&mut self) -> io::Result<Option<EncoderExit>>;

    /// Writes the graceful-quit command. Returns `Ok(false)` when no input
    /// channel is attached (or it was already closed), in which case the
    /// caller should escalate straight to a terminate signal.
    fn send_graceful_quit(&mut self) -> io::Result<bool>;

    fn terminate(&mut self) -> io::Result<()>;

    fn kill(&mut self) -> io::Result<()>;

    /// Blocks until the process has exited and been reaped.
    fn wait(&mut self) -> io::Result<EncoderExit>;
}

/// Starts encoder subprocesses for new sessions.
pub trait EncoderLauncher: Send {
    type Process: EncoderProcess;

    fn launch(&mut self, session: &RecordingSession) -> Result<Self::Process, LaunchError>;
}

/// Launches ffmpeg with native time-based segmenting.
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    config: Arc<RecorderConfig>,
}

impl FfmpegLauncher {
    pub fn new(config: Arc<RecorderConfig>) -> Self {
        Self { config }
    }

    /// Full argument list passed to the encoder.
    pub fn arguments(&self) -> Vec<OsString> {
        encoder_arguments(&self.config)
    }
}

impl EncoderLauncher for FfmpegLauncher {
    type Process = FfmpegProcess;

    fn launch(&mut self, session: &RecordingSession) -> Result<FfmpegProcess, LaunchError> {
        fs::create_dir_all(&self.config.record_dir).map_err(|source| LaunchError::RecordDir {
            path: self.config.record_dir.clone(),
            source,
        })?;

        let mut cmd = Command::new(&self.config.ffmpeg_path);
        cmd.args(self.arguments())
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        configure_process_group(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            program: self.config.ffmpeg_path.display().to_string(),
            source,
        })?;

        info!(
            session_id = session.id,
            pid = child.id(),
            output = %session.output_path.display(),
            "Encoder launched"
        );

        let stdin = child.stdin.take();
        Ok(FfmpegProcess { child, stdin })
    }
}

pub fn encoder_arguments(config: &RecorderConfig) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        config.encoder_log_level.clone().into(),
    ];
    if !config.encoder_stats {
        args.push("-nostats".into());
    }
    args.extend([
        "-rtsp_transport".into(),
        config.rtsp_transport.as_str().into(),
        "-i".into(),
        config.rtsp_url.clone().into(),
        "-c".into(),
        "copy".into(),
        "-f".into(),
        "segment".into(),
        "-reset_timestamps".into(),
        "1".into(),
        "-strftime".into(),
        "1".into(),
        "-segment_time".into(),
        config.segment_duration.as_secs().max(1).to_string().into(),
        "-segment_format".into(),
        config.segment_format.clone().into(),
    ]);
    args.push(encoder_output_pattern(&config.record_dir, config.segment_extension()).into());
    args
}

/// A running ffmpeg child.
#[derive(Debug)]
pub struct FfmpegProcess {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl EncoderProcess for FfmpegProcess {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn poll_exit(&mut self) -> io::Result<Option<EncoderExit>> {
        Ok(self.child.try_wait()?.map(EncoderExit::from_status))
    }

    fn send_graceful_quit(&mut self) -> io::Result<bool> {
        let Some(mut stdin) = self.stdin.take() else {
            return Ok(false);
        };
        match stdin.write_all(GRACEFUL_QUIT_INPUT).and_then(|_| stdin.flush()) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                debug!(pid = self.child.id(), "Encoder stdin already closed");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    fn terminate(&mut self) -> io::Result<()> {
        signal_group(&mut self.child, Signal::Terminate)
    }

    fn kill(&mut self) -> io::Result<()> {
        signal_group(&mut self.child, Signal::Kill)
    }

    fn wait(&mut self) -> io::Result<EncoderExit> {
        self.stdin = None;
        self.child.wait().map(EncoderExit::from_status)
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn configure_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn configure_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn signal_group(child: &mut Child, signal: Signal) -> io::Result<()> {
    let signo = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let pgid = child.id() as i32;
    // SAFETY: kill(2) with a negative pid targets the process group we created
    // at spawn. The child has not been reaped yet, so the group id is still ours.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::kill(-pgid, signo) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        // Group already gone; make sure the leader itself gets the signal.
        // SAFETY: same pid as above, still unreaped.
        #[allow(unsafe_code)]
        let rc = unsafe { libc::kill(pgid, signo) };
        if rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(io::Error::last_os_error());
    }
    Err(err)
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _signal: Signal) -> io::Result<()> {
    child.kill()
}
