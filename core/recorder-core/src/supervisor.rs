//! Recording supervisor: the main control loop.
//!
//! ```text
//! start retention worker
//! loop until shutdown:
//!     begin session (derive output path) -> launch encoder
//!     supervise: poll exit / liveness events / shutdown flag
//!     stale or shutdown -> escalate stop (graceful -> TERM -> KILL -> reap)
//!     restart policy decides: relaunch now, relaunch after backoff, or stop
//! stop retention worker
//! ```
//!
//! The supervisor is the only writer of the active session and of the shared
//! active-segment view. A new encoder is never launched before the previous
//! one has been reaped.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::RecorderConfig;
use crate::encoder::{EncoderLauncher, EncoderProcess};
use crate::liveness::{LivenessMonitor, LivenessVerdict, StaleReason};
use crate::restart::{
    classify, ExitClass, RestartDecision, RestartPolicy, Termination,
    LAUNCH_FAILURE_ALERT_THRESHOLD,
};
use crate::retention::{ActiveSegment, RetentionWorker};
use crate::session::{RecordingSession, SessionState};
use crate::shutdown::{
    deadline_after, next_slice, request_stop, EscalationTimeouts, ShutdownFlag,
};

const MONITOR_SLEEP_SLICE: Duration = Duration::from_millis(20);

/// Counters for one supervisor run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub sessions_launched: u64,
    pub launch_failures: u64,
    pub expected_exits: u64,
    pub crash_exits: u64,
    pub stale_restarts: u64,
}

/// Events from the liveness thread to the control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionEvent {
    Rolled {
        path: PathBuf,
        size: u64,
        observed_at: Instant,
    },
    Progress {
        size: u64,
        observed_at: Instant,
    },
    Stale(StaleReason),
}

enum SessionEnd {
    Ended(Termination),
    Shutdown,
}

pub struct Supervisor<L: EncoderLauncher> {
    config: Arc<RecorderConfig>,
    launcher: L,
    shutdown: ShutdownFlag,
    policy: RestartPolicy,
    active: ActiveSegment,
    timeouts: EscalationTimeouts,
    stats: SupervisorStats,
    next_session_id: u64,
}

impl<L: EncoderLauncher> Supervisor<L> {
    pub fn new(config: Arc<RecorderConfig>, launcher: L, shutdown: ShutdownFlag) -> Self {
        let timeouts = EscalationTimeouts::from_config(&config);
        Self {
            config,
            launcher,
            shutdown,
            policy: RestartPolicy::default(),
            active: ActiveSegment::new(),
            timeouts,
            stats: SupervisorStats::default(),
            next_session_id: 1,
        }
    }

    pub fn with_policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_escalation_timeouts(mut self, timeouts: EscalationTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Shared view of the segment currently being written.
    pub fn active_segment(&self) -> ActiveSegment {
        self.active.clone()
    }

    /// Runs until shutdown is requested and the last encoder has been reaped.
    pub fn run(mut self) -> SupervisorStats {
        info!(
            url = %self.config.rtsp_url,
            record_dir = %self.config.record_dir.display(),
            segment_secs = self.config.segment_duration.as_secs(),
            "Recording supervisor started"
        );

        let retention = RetentionWorker::spawn(
            Arc::clone(&self.config),
            self.active.clone(),
            self.shutdown.clone(),
        );

        let mut consecutive_launch_failures: u32 = 0;

        while !self.shutdown.is_requested() {
            let mut session = self.begin_session();
            // Snapshot the directory before the encoder can write to it.
            let monitor = LivenessMonitor::new(
                &session,
                &self.config.record_dir,
                self.config.segment_extension(),
                self.config.stale_timeout,
            );

            let mut process = match self.launcher.launch(&session) {
                Ok(process) => process,
                Err(err) => {
                    consecutive_launch_failures = consecutive_launch_failures.saturating_add(1);
                    self.stats.launch_failures += 1;
                    let delay = self.policy.launch_backoff(consecutive_launch_failures);
                    if consecutive_launch_failures >= LAUNCH_FAILURE_ALERT_THRESHOLD {
                        error!(
                            error = %err,
                            failures = consecutive_launch_failures,
                            retry_secs = delay.as_secs_f64(),
                            "Encoder keeps failing to launch; still retrying"
                        );
                    } else {
                        warn!(
                            error = %err,
                            failures = consecutive_launch_failures,
                            retry_secs = delay.as_secs_f64(),
                            "Encoder launch failed; retrying"
                        );
                    }
                    if self.shutdown.sleep(delay) {
                        break;
                    }
                    continue;
                }
            };
            consecutive_launch_failures = 0;
            self.stats.sessions_launched += 1;
            self.active.set(Some(session.output_path.clone()));
            retention.wake();

            let end = self.supervise(&mut session, &mut process, monitor, &retention);

            let termination = match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Ended(termination) => termination,
            };
            self.record_termination(&termination);

            let decision =
                self.policy
                    .decide(&termination, self.shutdown.is_requested(), Instant::now());
            match decision {
                RestartDecision::Stop => break,
                RestartDecision::Restart { delay } => {
                    info!(
                        session_id = session.id,
                        delay_secs = delay.as_secs_f64(),
                        "Starting next recording session"
                    );
                    if !delay.is_zero() && self.shutdown.sleep(delay) {
                        break;
                    }
                }
            }
        }

        self.active.set(None);
        retention.stop();
        info!(
            sessions = self.stats.sessions_launched,
            crashes = self.stats.crash_exits,
            stale_restarts = self.stats.stale_restarts,
            launch_failures = self.stats.launch_failures,
            "Recording supervisor stopped"
        );
        self.stats
    }

    fn begin_session(&mut self) -> RecordingSession {
        let id = self.next_session_id;
        self.next_session_id += 1;
        let session = RecordingSession::begin(
            id,
            &self.config.record_dir,
            self.config.segment_extension(),
        );
        debug!(
            session_id = id,
            output = %session.output_path.display(),
            "Recording session planned"
        );
        session
    }

    fn supervise(
        &mut self,
        session: &mut RecordingSession,
        process: &mut L::Process,
        monitor: LivenessMonitor,
        retention: &RetentionWorker,
    ) -> SessionEnd {
        let stop_monitor = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let monitor_thread = spawn_monitor(
            monitor,
            self.config.monitor_interval,
            Arc::clone(&stop_monitor),
            self.shutdown.clone(),
            tx,
        );
        let mut events: Option<Receiver<SessionEvent>> = Some(rx);

        let end = loop {
            if self.shutdown.is_requested() {
                info!(session_id = session.id, "Stopping encoder for shutdown");
                self.stop_encoder(session, process);
                break SessionEnd::Shutdown;
            }

            match process.poll_exit() {
                Ok(Some(exit)) => {
                    session.state = SessionState::Exited(exit);
                    break SessionEnd::Ended(Termination::Exited(exit));
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(session_id = session.id, error = %err, "Failed to poll encoder");
                }
            }

            let Some(rx) = events.as_ref() else {
                self.shutdown.sleep(self.config.poll_interval);
                continue;
            };
            match rx.recv_timeout(self.config.poll_interval) {
                Ok(SessionEvent::Rolled {
                    path,
                    size,
                    observed_at,
                }) => {
                    info!(session_id = session.id, path = %path.display(), "Encoder writing new segment");
                    session.last_observed_size = size;
                    session.last_observed_time = Some(observed_at);
                    self.active.set(Some(path));
                    retention.wake();
                }
                Ok(SessionEvent::Progress { size, observed_at }) => {
                    session.last_observed_size = size;
                    session.last_observed_time = Some(observed_at);
                }
                Ok(SessionEvent::Stale(reason)) => {
                    warn!(
                        session_id = session.id,
                        reason = ?reason,
                        stale_timeout_secs = self.config.stale_timeout.as_secs_f64(),
                        "Encoder stalled; forcing restart"
                    );
                    session.state = SessionState::Stale;
                    self.stop_encoder(session, process);
                    break SessionEnd::Ended(Termination::Stale(reason));
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    events = None;
                }
            }
        };

        stop_monitor.store(true, Ordering::SeqCst);
        if let Some(handle) = monitor_thread {
            if handle.join().is_err() {
                warn!(session_id = session.id, "Liveness monitor panicked");
            }
        }
        end
    }

    fn stop_encoder(&self, session: &RecordingSession, process: &mut L::Process) {
        match request_stop(process, &self.timeouts) {
            Ok(outcome) => info!(
                session_id = session.id,
                exit = %outcome.exit,
                escalated_to = ?outcome.escalated_to(),
                "Encoder stopped"
            ),
            Err(err) => error!(
                session_id = session.id,
                error = %err,
                "Failed to reap encoder after kill"
            ),
        }
    }

    fn record_termination(&mut self, termination: &Termination) {
        match termination {
            Termination::Stale(_) => {
                self.stats.stale_restarts += 1;
            }
            Termination::Exited(exit) => match classify(termination) {
                ExitClass::Expected => {
                    self.stats.expected_exits += 1;
                    info!(exit = %exit, "Encoder exited");
                }
                ExitClass::Crash => {
                    self.stats.crash_exits += 1;
                    warn!(exit = %exit, "Encoder crashed");
                }
            },
        }
    }
}

fn spawn_monitor(
    mut monitor: LivenessMonitor,
    interval: Duration,
    stop: Arc<AtomicBool>,
    shutdown: ShutdownFlag,
    tx: Sender<SessionEvent>,
) -> Option<JoinHandle<()>> {
    let spawned = thread::Builder::new()
        .name("liveness".to_string())
        .spawn(move || {
            let mut reported = monitor.last_observed_time();
            loop {
                if !sleep_until_stopped(interval, &stop, &shutdown) {
                    return;
                }
                let event = match monitor.tick(Instant::now()) {
                    LivenessVerdict::Waiting => continue,
                    LivenessVerdict::Healthy => {
                        if monitor.last_observed_time() == reported {
                            continue;
                        }
                        SessionEvent::Progress {
                            size: monitor.last_observed_size(),
                            observed_at: monitor.last_observed_time(),
                        }
                    }
                    LivenessVerdict::Rolled(path) => SessionEvent::Rolled {
                        path,
                        size: monitor.last_observed_size(),
                        observed_at: monitor.last_observed_time(),
                    },
                    LivenessVerdict::Stale(reason) => SessionEvent::Stale(reason),
                };
                reported = monitor.last_observed_time();
                let stale = matches!(event, SessionEvent::Stale(_));
                if tx.send(event).is_err() || stale {
                    return;
                }
            }
        });

    match spawned {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!(error = %err, "Failed to start liveness monitor");
            None
        }
    }
}

/// Sleeps one tick. Returns `false` if the monitor should exit instead.
fn sleep_until_stopped(interval: Duration, stop: &AtomicBool, shutdown: &ShutdownFlag) -> bool {
    let deadline = deadline_after(interval);
    loop {
        if stop.load(Ordering::SeqCst) || shutdown.is_requested() {
            return false;
        }
        match next_slice(deadline, MONITOR_SLEEP_SLICE) {
            Some(slice) => thread::sleep(slice),
            None => return true,
        }
    }
}
